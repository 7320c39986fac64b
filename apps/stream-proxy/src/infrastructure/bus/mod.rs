//! In-Process Channel Bus
//!
//! Implements the [`Bus`] port on bounded tokio broadcast channels, one per
//! named channel. This is the shipped broker: a single-process deployment
//! needs no external broker, and anything out of process can implement the
//! same port without touching the core.
//!
//! Delivery matches the port contract: at most once, publish order per
//! channel, and a reader that falls behind the channel capacity lags and
//! drops instead of backpressuring the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::application::ports::{Bus, BusError, BusReader};

/// Default per-channel buffer capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

// =============================================================================
// Channel Bus
// =============================================================================

/// Named-channel broker backed by `tokio::sync::broadcast`.
pub struct ChannelBus {
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl ChannelBus {
    /// Create a bus with the given per-channel buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a bus with the default capacity.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Shut the bus down. Every subsequent publish/subscribe fails with
    /// [`BusError::Unavailable`] and open readers observe channel closure.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.write().clear();
    }

    /// Whether the bus has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of channels with at least one live subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .values()
            .filter(|tx| tx.receiver_count() > 0)
            .count()
    }

    /// Number of live subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn prune(&self, channel: &str) {
        let mut channels = self.channels.write();
        if let Some(tx) = channels.get(channel)
            && tx.receiver_count() == 0
        {
            channels.remove(channel);
        }
    }
}

#[async_trait]
impl Bus for ChannelBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Unavailable);
        }

        let sender = self.channels.read().get(channel).cloned();

        match sender {
            Some(tx) => {
                // Err means every receiver is gone; the entry is stale.
                if tx.send(payload).is_err() {
                    self.prune(channel);
                }
                Ok(())
            }
            // No subscribers: best effort, drop the payload.
            None => Ok(()),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusReader>, BusError> {
        if self.is_closed() {
            return Err(BusError::Unavailable);
        }

        let rx = {
            let mut channels = self.channels.write();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        Ok(Box::new(ChannelBusReader { rx }))
    }
}

// =============================================================================
// Reader
// =============================================================================

struct ChannelBusReader {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl BusReader for ChannelBusReader {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>, BusError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => Err(BusError::Lagged(n)),
            Ok(Err(broadcast::error::RecvError::Closed)) => Err(BusError::Closed),
            Err(_) => Ok(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
