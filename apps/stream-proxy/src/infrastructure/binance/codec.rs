//! Stream Codec
//!
//! Decodes combined-stream text frames into [`NormalizedTick`] records.
//! A malformed frame is an error for the caller to log and skip; it must
//! never take the read loop down.

use crate::domain::tick::NormalizedTick;
use crate::infrastructure::binance::messages::{CombinedStreamFrame, TRADE_EVENT_TYPE};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carried an event type this codec does not handle.
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),
}

/// Decode a combined-stream frame into a normalized tick.
///
/// # Errors
///
/// Returns an error if the frame is not valid JSON, does not match the
/// combined-stream envelope, or carries a non-trade event.
pub fn decode_combined_frame(text: &str) -> Result<NormalizedTick, CodecError> {
    let frame: CombinedStreamFrame = serde_json::from_str(text)?;

    if frame.data.event_type != TRADE_EVENT_TYPE {
        return Err(CodecError::UnsupportedEvent(frame.data.event_type));
    }

    Ok(NormalizedTick {
        symbol: frame.data.symbol,
        price: frame.data.price,
        quantity: frame.data.quantity,
        exchange_time: frame.data.event_time,
        trade_id: frame.data.trade_id,
        is_buyer_maker: frame.data.is_buyer_maker,
    })
}
