//! Binance Ingestor
//!
//! Owns the single upstream combined-stream connection. Decodes every frame,
//! normalizes it, and publishes it to the bus under the per-symbol channel
//! plus the aggregate channel.
//!
//! # Lifecycle
//!
//! The connection is a state machine:
//!
//! ```text
//! Stopped → Connecting → Streaming → Reconnecting → Streaming
//!    ↑           ↑            │            │
//!    └───────────┴────────────┴────────────┘
//! ```
//!
//! Changing the tracked symbol set forces a reconnect with a rebuilt stream
//! URL (the combined endpoint fixes its streams at handshake time). An empty
//! tracked set parks the supervisor in `Stopped` until symbols are added
//! again. Consecutive connection failures back off exponentially; once the
//! attempt budget is exhausted the ingestor reports itself stopped instead of
//! hanging.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::application::ports::{Bus, UpstreamControl, aggregate_channel, symbol_channel};
use crate::domain::subscription::Symbol;
use crate::domain::tick::NormalizedTick;
use crate::infrastructure::binance::codec::decode_combined_frame;
use crate::infrastructure::binance::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::metrics;

// =============================================================================
// Errors and Events
// =============================================================================

/// Errors from the upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// WebSocket handshake or transport failure.
    #[error("upstream connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Lifecycle events emitted by the ingestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    /// Combined stream connected.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Reconnect attempt in progress.
    Reconnecting {
        /// Consecutive attempt number.
        attempt: u32,
    },
    /// The tracked symbol set changed.
    SymbolsChanged {
        /// New tracked symbol count.
        tracked: usize,
    },
    /// Reconnect budget exhausted; no fresh data until symbols change.
    Stopped,
}

/// Connection state of the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestorState {
    /// Not connected; parked until symbols exist and connecting succeeds.
    #[default]
    Stopped,
    /// Handshake in progress.
    Connecting,
    /// Connected and publishing ticks.
    Streaming,
    /// Backing off before the next connect attempt.
    Reconnecting,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the ingestor.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// WebSocket base URL (e.g. `wss://stream.binance.com:9443`).
    pub ws_base: String,
    /// Bus channel prefix for published ticks.
    pub channel_prefix: String,
    /// System-wide cap on tracked symbols.
    pub max_total_symbols: usize,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
}

// =============================================================================
// Ingestor
// =============================================================================

enum StreamExit {
    Cancelled,
    Resubscribe,
    Drained,
    Disconnected,
}

/// Upstream combined-stream connector.
pub struct Ingestor {
    config: IngestorConfig,
    bus: Arc<dyn Bus>,
    tracked: RwLock<BTreeSet<Symbol>>,
    /// Symbols configured at startup; never dropped by demand-driven release.
    pinned: BTreeSet<Symbol>,
    changed: Notify,
    state_tx: watch::Sender<IngestorState>,
    event_tx: mpsc::Sender<IngestEvent>,
    cancel: CancellationToken,
}

impl Ingestor {
    /// Create a new ingestor tracking `initial_symbols` (clipped to the
    /// global cap). The initial symbols stay tracked for the life of the
    /// process; only explicit [`Ingestor::remove_symbols`] drops them.
    #[must_use]
    pub fn new(
        config: IngestorConfig,
        bus: Arc<dyn Bus>,
        initial_symbols: Vec<Symbol>,
        event_tx: mpsc::Sender<IngestEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let pinned: BTreeSet<Symbol> = initial_symbols
            .into_iter()
            .map(|s| s.to_uppercase())
            .take(config.max_total_symbols)
            .collect();

        Self {
            config,
            bus,
            tracked: RwLock::new(pinned.clone()),
            pinned,
            changed: Notify::new(),
            state_tx: watch::channel(IngestorState::Stopped).0,
            event_tx,
            cancel,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> IngestorState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<IngestorState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the tracked symbol set.
    #[must_use]
    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        self.tracked.read().iter().cloned().collect()
    }

    /// Number of tracked symbols.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.read().len()
    }

    /// Add symbols to the tracked set, clipped to the global cap.
    ///
    /// Returns the symbols actually added (may be fewer than requested).
    /// Triggers a reconnect when anything was added.
    pub fn add_symbols(&self, symbols: &[Symbol]) -> Vec<Symbol> {
        let added = {
            let mut tracked = self.tracked.write();
            let headroom = self.config.max_total_symbols.saturating_sub(tracked.len());

            let added: Vec<Symbol> = symbols
                .iter()
                .map(|s| s.to_uppercase())
                .filter(|s| !tracked.contains(s))
                .take(headroom)
                .collect();

            for symbol in &added {
                tracked.insert(symbol.clone());
            }
            added
        };

        if !added.is_empty() {
            self.on_symbols_changed();
        }
        added
    }

    /// Remove symbols from the tracked set.
    ///
    /// Returns the symbols actually removed. Removing the last symbol stops
    /// streaming until symbols are added again.
    pub fn remove_symbols(&self, symbols: &[Symbol]) -> Vec<Symbol> {
        let removed = {
            let mut tracked = self.tracked.write();
            symbols
                .iter()
                .map(|s| s.to_uppercase())
                .filter(|s| tracked.remove(s))
                .collect::<Vec<_>>()
        };

        if !removed.is_empty() {
            self.on_symbols_changed();
        }
        removed
    }

    /// Make sure the upstream carries these symbols (demand-driven path).
    ///
    /// Returns the subset that is now tracked; symbols refused by the global
    /// cap are absent.
    pub fn ensure_symbols(&self, symbols: &[Symbol]) -> Vec<Symbol> {
        let (now_tracked, added_any) = {
            let mut tracked = self.tracked.write();
            let mut now_tracked = Vec::with_capacity(symbols.len());
            let mut added_any = false;

            for symbol in symbols {
                let symbol = symbol.to_uppercase();
                if tracked.contains(&symbol) {
                    now_tracked.push(symbol);
                } else if tracked.len() < self.config.max_total_symbols {
                    tracked.insert(symbol.clone());
                    now_tracked.push(symbol);
                    added_any = true;
                }
            }
            (now_tracked, added_any)
        };

        if added_any {
            self.on_symbols_changed();
        }
        now_tracked
    }

    /// Drop demand-driven symbols nobody needs anymore. Pinned (startup)
    /// symbols are kept so aggregate-channel consumers never lose them.
    pub fn release_symbols(&self, symbols: &[Symbol]) {
        let removable: Vec<Symbol> = symbols
            .iter()
            .map(|s| s.to_uppercase())
            .filter(|s| !self.pinned.contains(s))
            .collect();

        if !removable.is_empty() {
            let _ = self.remove_symbols(&removable);
        }
    }

    fn on_symbols_changed(&self) {
        let tracked = self.tracked_count();
        metrics::set_tracked_symbols(tracked as f64);
        let _ = self
            .event_tx
            .try_send(IngestEvent::SymbolsChanged { tracked });
        self.changed.notify_one();
    }

    fn set_state(&self, state: IngestorState) {
        self.state_tx.send_replace(state);
    }

    async fn send_event(&self, event: IngestEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Combined stream URL for the current tracked set, or `None` when empty.
    fn stream_url(&self) -> Option<String> {
        let tracked = self.tracked.read();
        if tracked.is_empty() {
            return None;
        }

        let streams = tracked
            .iter()
            .map(|s| format!("{}@trade", s.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");

        Some(format!("{}/stream?streams={streams}", self.config.ws_base))
    }

    /// Run the ingestor until cancelled.
    ///
    /// Supervises the connection: parks while the tracked set is empty,
    /// reconnects on symbol changes, backs off on failures, and reports
    /// `Stopped` once the retry budget is exhausted.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                self.set_state(IngestorState::Stopped);
                return;
            }

            if self.tracked_count() == 0 {
                self.set_state(IngestorState::Stopped);
                tracing::info!("no tracked symbols, ingestor parked");
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = self.changed.notified() => continue,
                }
            }

            let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

            'connection: loop {
                let Some(url) = self.stream_url() else {
                    break 'connection;
                };

                self.set_state(IngestorState::Connecting);
                tracing::info!(symbols = self.tracked_count(), "connecting to combined stream");

                match tokio_tungstenite::connect_async(&url).await {
                    Ok((ws, _response)) => {
                        policy.reset();
                        self.set_state(IngestorState::Streaming);
                        self.send_event(IngestEvent::Connected).await;
                        tracing::info!("combined stream connected");

                        match self.read_loop(ws).await {
                            StreamExit::Cancelled => {
                                self.set_state(IngestorState::Stopped);
                                return;
                            }
                            StreamExit::Resubscribe => {
                                tracing::info!("symbol set changed, reconnecting");
                                continue 'connection;
                            }
                            StreamExit::Drained => break 'connection,
                            StreamExit::Disconnected => {
                                self.send_event(IngestEvent::Disconnected).await;
                            }
                        }
                    }
                    Err(e) => {
                        let err = IngestError::Connect(e);
                        tracing::warn!(error = %err, "combined stream connect failed");
                    }
                }

                if let Some(delay) = policy.next_delay() {
                    let attempt = policy.attempt_count();
                    self.set_state(IngestorState::Reconnecting);
                    self.send_event(IngestEvent::Reconnecting { attempt }).await;
                    metrics::record_reconnect();
                    tracing::info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "reconnecting to combined stream"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.set_state(IngestorState::Stopped);
                            return;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                } else {
                    self.set_state(IngestorState::Stopped);
                    self.send_event(IngestEvent::Stopped).await;
                    tracing::error!("reconnect attempts exhausted, ingestor stopped");

                    // A symbol change re-arms the retry budget.
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = self.changed.notified() => break 'connection,
                    }
                }
            }
        }
    }

    /// Process frames until cancellation, a symbol-set change, or a
    /// transport failure. The socket is closed before returning so a
    /// reconnect never races the old connection.
    async fn read_loop(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> StreamExit {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.close().await;
                    return StreamExit::Cancelled;
                }
                () = self.changed.notified() => {
                    let _ = write.close().await;
                    return if self.tracked_count() == 0 {
                        StreamExit::Drained
                    } else {
                        StreamExit::Resubscribe
                    };
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()).await,
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return StreamExit::Disconnected;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("combined stream closed by server");
                        return StreamExit::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "combined stream read error");
                        return StreamExit::Disconnected;
                    }
                }
            }
        }
    }

    /// Decode one frame and publish it. A bad frame is logged and skipped,
    /// never fatal to the read loop.
    async fn handle_frame(&self, text: &str) {
        let tick = match decode_combined_frame(text) {
            Ok(tick) => tick,
            Err(e) => {
                metrics::record_decode_error();
                let preview = text.get(..100).unwrap_or(text);
                tracing::warn!(error = %e, frame = preview, "dropping undecodable frame");
                return;
            }
        };

        metrics::record_tick_received(&tick.symbol);
        self.publish_tick(&tick).await;
    }

    async fn publish_tick(&self, tick: &NormalizedTick) {
        let payload = match serde_json::to_string(tick) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "tick serialization failed");
                return;
            }
        };

        let channel = symbol_channel(&self.config.channel_prefix, &tick.symbol);
        if let Err(e) = self.bus.publish(&channel, payload.clone()).await {
            tracing::warn!(error = %e, channel = %channel, "bus publish failed");
            return;
        }

        let all = aggregate_channel(&self.config.channel_prefix);
        if let Err(e) = self.bus.publish(&all, payload).await {
            tracing::warn!(error = %e, channel = %all, "aggregate publish failed");
            return;
        }

        metrics::record_tick_published(&tick.symbol);
    }
}

// =============================================================================
// Upstream Control Handle
// =============================================================================

/// Cloneable [`UpstreamControl`] handle over a shared ingestor.
#[derive(Clone)]
pub struct IngestorHandle(Arc<Ingestor>);

impl IngestorHandle {
    /// Wrap a shared ingestor.
    #[must_use]
    pub const fn new(ingestor: Arc<Ingestor>) -> Self {
        Self(ingestor)
    }
}

#[async_trait]
impl UpstreamControl for IngestorHandle {
    async fn ensure_symbols(&self, symbols: &[Symbol]) -> Vec<Symbol> {
        self.0.ensure_symbols(symbols)
    }

    async fn release_symbols(&self, symbols: &[Symbol]) {
        self.0.release_symbols(symbols);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::ChannelBus;

    fn make_ingestor(max_total: usize, initial: &[&str]) -> (Arc<Ingestor>, mpsc::Receiver<IngestEvent>) {
        let config = IngestorConfig {
            ws_base: "wss://stream.example.test:9443".to_string(),
            channel_prefix: "prices".to_string(),
            max_total_symbols: max_total,
            reconnect: ReconnectConfig::default(),
        };
        let (event_tx, event_rx) = mpsc::channel(16);
        let ingestor = Arc::new(Ingestor::new(
            config,
            Arc::new(ChannelBus::with_defaults()),
            initial.iter().map(|s| (*s).to_string()).collect(),
            event_tx,
            CancellationToken::new(),
        ));
        (ingestor, event_rx)
    }

    #[tokio::test]
    async fn starts_stopped_with_initial_symbols() {
        let (ingestor, _rx) = make_ingestor(50, &["BTCUSDT", "ETHUSDT"]);

        assert_eq!(ingestor.state(), IngestorState::Stopped);
        assert_eq!(ingestor.tracked_symbols(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn add_symbols_clips_to_global_cap() {
        let (ingestor, _rx) = make_ingestor(3, &["BTCUSDT", "ETHUSDT"]);

        let added = ingestor.add_symbols(&["BNBUSDT".to_string(), "SOLUSDT".to_string()]);

        assert_eq!(added, vec!["BNBUSDT"]);
        assert_eq!(ingestor.tracked_count(), 3);
    }

    #[tokio::test]
    async fn add_symbols_normalizes_and_dedupes() {
        let (ingestor, _rx) = make_ingestor(50, &["BTCUSDT"]);

        let added = ingestor.add_symbols(&["btcusdt".to_string(), "ethusdt".to_string()]);

        assert_eq!(added, vec!["ETHUSDT"]);
    }

    #[tokio::test]
    async fn remove_symbols_reports_actual_removals() {
        let (ingestor, _rx) = make_ingestor(50, &["BTCUSDT", "ETHUSDT"]);

        let removed = ingestor.remove_symbols(&["ETHUSDT".to_string(), "XRPUSDT".to_string()]);

        assert_eq!(removed, vec!["ETHUSDT"]);
        assert_eq!(ingestor.tracked_symbols(), vec!["BTCUSDT"]);
    }

    #[tokio::test]
    async fn ensure_reports_tracked_subset_under_cap() {
        let (ingestor, _rx) = make_ingestor(2, &["BTCUSDT"]);

        let tracked = ingestor.ensure_symbols(&[
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "BNBUSDT".to_string(),
        ]);

        // BTCUSDT already tracked, ETHUSDT fits, BNBUSDT refused by the cap.
        assert_eq!(tracked, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(ingestor.tracked_count(), 2);
    }

    #[tokio::test]
    async fn release_keeps_pinned_symbols() {
        let (ingestor, _rx) = make_ingestor(50, &["BTCUSDT"]);
        ingestor.ensure_symbols(&["ETHUSDT".to_string()]);

        ingestor.release_symbols(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);

        assert_eq!(ingestor.tracked_symbols(), vec!["BTCUSDT"]);
    }

    #[tokio::test]
    async fn explicit_remove_drops_pinned_symbols() {
        let (ingestor, _rx) = make_ingestor(50, &["BTCUSDT"]);

        let removed = ingestor.remove_symbols(&["BTCUSDT".to_string()]);

        assert_eq!(removed, vec!["BTCUSDT"]);
        assert_eq!(ingestor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn symbol_changes_emit_events() {
        let (ingestor, mut rx) = make_ingestor(50, &[]);

        ingestor.add_symbols(&["BTCUSDT".to_string()]);

        assert_eq!(rx.recv().await, Some(IngestEvent::SymbolsChanged { tracked: 1 }));
    }

    #[tokio::test]
    async fn stream_url_lists_all_tracked_streams() {
        let (ingestor, _rx) = make_ingestor(50, &["ETHUSDT", "BTCUSDT"]);

        let url = ingestor.stream_url().unwrap();

        assert_eq!(
            url,
            "wss://stream.example.test:9443/stream?streams=btcusdt@trade/ethusdt@trade"
        );
    }

    #[tokio::test]
    async fn stream_url_empty_set_is_none() {
        let (ingestor, _rx) = make_ingestor(50, &[]);
        assert!(ingestor.stream_url().is_none());
    }

    #[tokio::test]
    async fn parked_supervisor_stops_on_cancel() {
        let config = IngestorConfig {
            ws_base: "wss://stream.example.test:9443".to_string(),
            channel_prefix: "prices".to_string(),
            max_total_symbols: 50,
            reconnect: ReconnectConfig::default(),
        };
        let (event_tx, _event_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let ingestor = Arc::new(Ingestor::new(
            config,
            Arc::new(ChannelBus::with_defaults()),
            vec![],
            event_tx,
            cancel.clone(),
        ));

        let handle = tokio::spawn(Arc::clone(&ingestor).run());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("supervisor should stop on cancel")
            .unwrap();
        assert_eq!(ingestor.state(), IngestorState::Stopped);
    }
}
