//! Normalized Trade Tick
//!
//! The canonical internal representation of an exchange trade. All upstream
//! wire formats are decoded into this type before anything else sees them,
//! and it is the payload published on the bus and delivered to clients.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single normalized exchange trade.
///
/// Immutable value type; has no identity beyond its fields. The serde field
/// names are the wire contract for bus payloads and client `price` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTick {
    /// Instrument symbol, upper case (e.g. `BTCUSDT`).
    pub symbol: String,

    /// Trade price.
    pub price: Decimal,

    /// Trade quantity in base asset units.
    pub quantity: Decimal,

    /// Exchange event time.
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub exchange_time: DateTime<Utc>,

    /// Exchange-assigned trade id.
    pub trade_id: u64,

    /// Whether the buyer was the maker side of the trade.
    pub is_buyer_maker: bool,
}
