//! Client Wire Protocol
//!
//! JSON frames exchanged with WebSocket clients.
//!
//! Client → server:
//!
//! ```json
//! {"type":"subscribe","symbols":["ETHUSDT","BNBUSDT"]}
//! {"type":"unsubscribe","symbols":["BNBUSDT"]}
//! {"type":"ping"}
//! ```
//!
//! Server → client:
//!
//! ```json
//! {"type":"price","symbol":"BTCUSDT","price":"50000.10", ...}
//! {"type":"subscribed","symbols":["BTCUSDT","ETHUSDT"]}
//! {"type":"unsubscribed","symbols":["BNBUSDT"]}
//! {"type":"pong"}
//! {"type":"error","code":"INVALID_JSON","message":"..."}
//! ```

use serde::{Deserialize, Serialize};

use crate::application::services::fanout::Outbound;
use crate::domain::tick::NormalizedTick;

// =============================================================================
// Client Messages
// =============================================================================

/// Control messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to symbols.
    Subscribe {
        /// Requested symbols.
        symbols: Vec<String>,
    },
    /// Unsubscribe from symbols.
    Unsubscribe {
        /// Symbols to drop.
        symbols: Vec<String>,
    },
    /// Liveness probe; answered with `pong`.
    Ping,
}

/// Why an inbound frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON or not an object.
    #[error("invalid JSON message")]
    InvalidJson,

    /// `symbols` was missing or not an array of strings.
    #[error("symbols must be an array of strings")]
    InvalidSymbols,

    /// Well-formed frame with a `type` this server does not know.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    /// Stable machine-readable code for error frames.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson => "INVALID_JSON",
            Self::InvalidSymbols => "INVALID_SYMBOLS",
            Self::UnknownType(_) => "UNKNOWN_TYPE",
        }
    }
}

/// Parse an inbound text frame.
///
/// Distinguishes malformed JSON from a well-formed frame with a bad
/// `symbols` field so the client gets a precise error code back.
///
/// # Errors
///
/// Returns [`ProtocolError`] as described on its variants.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::InvalidJson)?;

    match msg_type {
        "subscribe" | "unsubscribe" => {
            let is_string_array = value
                .get("symbols")
                .and_then(|s| s.as_array())
                .is_some_and(|arr| arr.iter().all(serde_json::Value::is_string));
            if !is_string_array {
                return Err(ProtocolError::InvalidSymbols);
            }
            serde_json::from_value(value).map_err(|_| ProtocolError::InvalidJson)
        }
        "ping" => Ok(ClientMessage::Ping),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Frames the server sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A tick for a subscribed symbol.
    Price(NormalizedTick),
    /// Subscribe acknowledgement with the symbols actually added.
    Subscribed {
        /// Accepted symbols.
        symbols: Vec<String>,
    },
    /// Unsubscribe acknowledgement.
    Unsubscribed {
        /// Removed symbols.
        symbols: Vec<String>,
    },
    /// Reply to `ping`.
    Pong,
    /// Request-level error.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl From<Outbound> for ServerMessage {
    fn from(outbound: Outbound) -> Self {
        match outbound {
            Outbound::Price(tick) => Self::Price(tick),
            Outbound::Subscribed(symbols) => Self::Subscribed { symbols },
            Outbound::Unsubscribed(symbols) => Self::Unsubscribed { symbols },
            Outbound::Pong => Self::Pong,
            Outbound::Error { code, message } => Self::Error { code, message },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::TimeZone;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn parses_subscribe() {
        let msg = parse_client_message(r#"{"type":"subscribe","symbols":["ETHUSDT"]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                symbols: vec!["ETHUSDT".to_string()]
            }
        );
    }

    #[test]
    fn parses_unsubscribe_and_ping() {
        assert_eq!(
            parse_client_message(r#"{"type":"unsubscribe","symbols":[]}"#).unwrap(),
            ClientMessage::Unsubscribe { symbols: vec![] }
        );
        assert_eq!(
            parse_client_message(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_client_message("{oops").unwrap_err();
        assert_eq!(err.code(), "INVALID_JSON");
    }

    #[test]
    fn rejects_missing_type() {
        let err = parse_client_message(r#"{"symbols":["BTCUSDT"]}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_JSON");
    }

    #[test]
    fn rejects_non_array_symbols() {
        let err = parse_client_message(r#"{"type":"subscribe","symbols":"BTCUSDT"}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_SYMBOLS");

        let err =
            parse_client_message(r#"{"type":"subscribe","symbols":[1,2]}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_SYMBOLS");

        let err = parse_client_message(r#"{"type":"subscribe"}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_SYMBOLS");
    }

    #[test]
    fn reports_unknown_type() {
        match parse_client_message(r#"{"type":"snooze"}"#) {
            Err(ProtocolError::UnknownType(t)) => assert_eq!(t, "snooze"),
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[test]
    fn price_frame_is_tagged_and_flat() {
        let tick = NormalizedTick {
            symbol: "BTCUSDT".to_string(),
            price: Decimal::from_str("50000.10").unwrap(),
            quantity: Decimal::from_str("0.5").unwrap(),
            exchange_time: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            trade_id: 42,
            is_buyer_maker: true,
        };

        let json = serde_json::to_value(ServerMessage::Price(tick)).unwrap();

        assert_eq!(json["type"], "price");
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["timestamp"], 1_700_000_000_123_i64);
    }

    #[test]
    fn ack_frames_serialize_with_tags() {
        let json = serde_json::to_value(ServerMessage::Subscribed {
            symbols: vec!["BTCUSDT".to_string()],
        })
        .unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["symbols"][0], "BTCUSDT");

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");

        let json = serde_json::to_value(ServerMessage::Error {
            code: "INVALID_JSON".to_string(),
            message: "bad".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "INVALID_JSON");
    }
}
