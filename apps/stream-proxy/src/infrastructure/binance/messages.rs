//! Binance Combined-Stream Wire Types
//!
//! Wire format types for deserializing combined-stream frames. The combined
//! endpoint wraps every payload in an envelope naming the originating
//! stream:
//!
//! ```json
//! {"stream":"btcusdt@trade","data":{"e":"trade","E":1700000000123,
//!  "s":"BTCUSDT","t":12345,"p":"50123.45","q":"0.002",
//!  "T":1700000000120,"m":true,"M":true}}
//! ```
//!
//! # References
//!
//! - [Trade Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#trade-streams)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Envelope wrapping every combined-stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedStreamFrame {
    /// Originating stream name (e.g. `btcusdt@trade`).
    pub stream: String,

    /// The trade event payload.
    pub data: TradeEvent,
}

/// A raw trade event as Binance sends it.
///
/// Prices and quantities arrive as decimal strings; `rust_decimal` parses
/// them losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Event type (always `trade` on a trade stream).
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time in epoch milliseconds.
    #[serde(rename = "E", with = "chrono::serde::ts_milliseconds")]
    pub event_time: DateTime<Utc>,

    /// Symbol, upper case.
    #[serde(rename = "s")]
    pub symbol: String,

    /// Exchange trade id.
    #[serde(rename = "t")]
    pub trade_id: u64,

    /// Trade price.
    #[serde(rename = "p")]
    pub price: Decimal,

    /// Trade quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,

    /// Trade time in epoch milliseconds.
    #[serde(rename = "T", with = "chrono::serde::ts_milliseconds")]
    pub trade_time: DateTime<Utc>,

    /// Whether the buyer is the market maker.
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Event type carried by `@trade` streams.
pub const TRADE_EVENT_TYPE: &str = "trade";

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn deserializes_combined_frame() {
        let json = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1700000000123,"s":"BTCUSDT","t":12345,"p":"50123.45","q":"0.002","b":88,"a":50,"T":1700000000120,"m":true,"M":true}}"#;

        let frame: CombinedStreamFrame = serde_json::from_str(json).unwrap();

        assert_eq!(frame.stream, "btcusdt@trade");
        assert_eq!(frame.data.symbol, "BTCUSDT");
        assert_eq!(frame.data.price, Decimal::from_str("50123.45").unwrap());
        assert_eq!(frame.data.quantity, Decimal::from_str("0.002").unwrap());
        assert_eq!(frame.data.trade_id, 12345);
        assert!(frame.data.is_buyer_maker);
        assert_eq!(frame.data.event_time.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn rejects_frame_without_data() {
        let json = r#"{"stream":"btcusdt@trade"}"#;
        assert!(serde_json::from_str::<CombinedStreamFrame>(json).is_err());
    }
}
