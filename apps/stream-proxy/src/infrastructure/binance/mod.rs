//! Binance WebSocket Adapter
//!
//! Implements the upstream connector for Binance's combined stream:
//! a single multiplexed WebSocket carrying one `@trade` stream per tracked
//! symbol. Symbol-set changes require a reconnect with a rebuilt stream URL.

pub mod codec;
pub mod ingestor;
pub mod messages;
pub mod reconnect;

pub use codec::{CodecError, decode_combined_frame};
pub use ingestor::{
    IngestError, IngestEvent, Ingestor, IngestorConfig, IngestorHandle, IngestorState,
};
pub use messages::{CombinedStreamFrame, TradeEvent};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
