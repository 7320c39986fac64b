//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Bus`]: named-channel publish/subscribe broker used to decouple
//!   ingestion from fan-out
//! - [`UpstreamControl`]: handle to the component that owns the upstream
//!   exchange connection, used to reference-count tracked symbols

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::subscription::Symbol;

/// Bus channel name for a single symbol (`<prefix>:<SYMBOL>`).
#[must_use]
pub fn symbol_channel(prefix: &str, symbol: &str) -> String {
    format!("{prefix}:{symbol}")
}

/// Bus channel name for the all-symbols aggregate (`<prefix>:all`).
#[must_use]
pub fn aggregate_channel(prefix: &str) -> String {
    format!("{prefix}:all")
}

/// Errors from the bus boundary.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker is shut down or disabled. Callers must treat this as a
    /// degraded-mode signal, not a fatal error.
    #[error("bus unavailable")]
    Unavailable,

    /// The reader fell behind and messages were discarded.
    #[error("bus reader lagged, {0} messages dropped")]
    Lagged(u64),

    /// The subscribed channel was closed by the broker.
    #[error("bus channel closed")]
    Closed,
}

/// Named-channel publish/subscribe broker.
///
/// Any number of publishers and subscribers per channel; at-most-once
/// delivery in publish order to currently-subscribed readers. A slow reader
/// must never backpressure a publisher beyond a bounded buffer.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to a channel. Best effort: publishing to a channel
    /// with no subscribers succeeds and drops the payload.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscribe to a channel. The reader yields payloads published after
    /// this call, in publish order, until dropped.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusReader>, BusError>;
}

/// Handle yielding payloads from a single bus channel.
///
/// Dropping the reader unsubscribes.
#[async_trait]
pub trait BusReader: Send {
    /// Wait up to `timeout` for the next payload.
    ///
    /// `Ok(Some(payload))` on a message, `Ok(None)` on timeout (poll again),
    /// `Err` on lag or channel closure. The short timeout is what keeps
    /// reader tasks promptly cancellable.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>, BusError>;
}

/// Reference-counted control over the upstream tracked symbol set.
///
/// The fan-out engine calls `ensure_symbols` when a symbol gains its first
/// subscriber and `release_symbols` when it loses its last one, so the
/// upstream connection only ever carries symbols somebody is receiving.
#[async_trait]
pub trait UpstreamControl: Send + Sync {
    /// Make sure the upstream carries these symbols. Returns the subset that
    /// is now tracked; symbols refused by the global cap are absent.
    async fn ensure_symbols(&self, symbols: &[Symbol]) -> Vec<Symbol>;

    /// Drop these symbols from the upstream tracked set.
    async fn release_symbols(&self, symbols: &[Symbol]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names() {
        assert_eq!(symbol_channel("prices", "BTCUSDT"), "prices:BTCUSDT");
        assert_eq!(aggregate_channel("prices"), "prices:all");
    }
}
