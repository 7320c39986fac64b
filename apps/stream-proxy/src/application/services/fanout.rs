//! Subscription Manager
//!
//! The fan-out engine between the bus and client connections. Multiplexes N
//! clients × M symbols onto at most M bus subscriptions: the first client to
//! want a symbol starts its bus reader task, the last one to leave stops it.
//!
//! # Concurrency
//!
//! A single async mutex guards the registry (subscription index, client
//! outboxes, reader handles); every logical operation — connect, subscribe,
//! unsubscribe, disconnect — mutates it in one critical section, which keeps
//! the client↔symbol indices in lock-step and reader lifecycle tied exactly
//! to subscriber counts. Reader tasks take a snapshot of the subscriber set
//! before sending so a disconnect discovered mid-broadcast never mutates a
//! collection being iterated.
//!
//! Clients are only ever written to through their bounded outbox: a full
//! outbox drops that frame for that client, a closed outbox disconnects the
//! client from all of its symbols. Nothing may bypass the registry and write
//! to a client socket directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{Bus, BusError, BusReader, UpstreamControl, symbol_channel};
use crate::domain::subscription::{ClientId, SubscriptionIndex, Symbol};
use crate::domain::tick::NormalizedTick;
use crate::infrastructure::metrics;

// =============================================================================
// Outbound Frames
// =============================================================================

/// Frames the manager hands to a client's outbox. The transport layer owns
/// turning these into wire JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A tick for a symbol the client subscribes to.
    Price(NormalizedTick),
    /// Acknowledgement of a subscribe request (the symbols actually added).
    Subscribed(Vec<Symbol>),
    /// Acknowledgement of an unsubscribe request.
    Unsubscribed(Vec<Symbol>),
    /// Reply to a client ping.
    Pong,
    /// Request-level error.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the subscription manager.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Bus channel prefix ticks are published under.
    pub channel_prefix: String,
    /// Per-client symbol cap.
    pub max_symbols_per_client: usize,
    /// Bus poll timeout; bounds how long cancellation can go unobserved.
    pub poll_timeout: Duration,
    /// Capacity of each client outbox.
    pub outbox_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "prices".to_string(),
            max_symbols_per_client: 20,
            poll_timeout: Duration::from_secs(1),
            outbox_capacity: 256,
        }
    }
}

/// Outcome of a subscribe request.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOutcome {
    /// Symbols actually subscribed (cap-clipped, may be fewer than asked).
    pub accepted: Vec<Symbol>,
    /// Set when one or more symbols were refused because the bus is down.
    pub bus_unavailable: bool,
}

/// Registry statistics for health reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanoutStats {
    /// Connected clients.
    pub clients: usize,
    /// Symbols with at least one subscriber.
    pub active_symbols: usize,
}

// =============================================================================
// Manager State
// =============================================================================

struct ReaderHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct ManagerState {
    index: SubscriptionIndex,
    outboxes: HashMap<ClientId, mpsc::Sender<Outbound>>,
    readers: HashMap<Symbol, ReaderHandle>,
}

enum StartReaderError {
    CapacityExceeded,
    Bus(BusError),
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Multiplexes client subscriptions onto per-symbol bus readers.
pub struct SubscriptionManager {
    bus: Arc<dyn Bus>,
    upstream: Arc<dyn UpstreamControl>,
    config: FanoutConfig,
    state: Mutex<ManagerState>,
    shutdown: CancellationToken,
}

impl SubscriptionManager {
    /// Create a new manager. Reader tasks are children of `shutdown` and
    /// stop when it is cancelled.
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        upstream: Arc<dyn UpstreamControl>,
        config: FanoutConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let max_symbols = config.max_symbols_per_client;
        Self {
            bus,
            upstream,
            config,
            state: Mutex::new(ManagerState {
                index: SubscriptionIndex::new(max_symbols),
                outboxes: HashMap::new(),
                readers: HashMap::new(),
            }),
            shutdown,
        }
    }

    /// Create the bounded outbox pair for a new client session.
    #[must_use]
    pub fn make_outbox(&self) -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(self.config.outbox_capacity)
    }

    /// Register a client and subscribe it to its initial symbols.
    ///
    /// Returns the new client id and the subscribe outcome.
    pub async fn connect(
        self: &Arc<Self>,
        outbox: mpsc::Sender<Outbound>,
        initial_symbols: &[Symbol],
    ) -> (ClientId, SubscribeOutcome) {
        let client = Uuid::new_v4().as_u64_pair().0;

        {
            let mut state = self.state.lock().await;
            state.index.register(client);
            state.outboxes.insert(client, outbox);
            metrics::set_ws_clients(state.index.client_count() as f64);
        }

        tracing::info!(client, "client connected");
        let outcome = self.subscribe(client, initial_symbols).await;
        (client, outcome)
    }

    /// Subscribe a client to symbols.
    ///
    /// Partial success is normal: requests beyond the per-client cap are
    /// clipped, symbols refused by the global cap or an unavailable bus are
    /// rolled back. The outcome reports exactly what was accepted.
    pub async fn subscribe(self: &Arc<Self>, client: ClientId, symbols: &[Symbol]) -> SubscribeOutcome {
        let symbols = normalize_symbols(symbols);
        let mut state = self.state.lock().await;

        if !state.index.is_registered(client) {
            return SubscribeOutcome::default();
        }

        let add = state.index.add(client, &symbols);
        let mut outcome = SubscribeOutcome {
            accepted: add.added,
            bus_unavailable: false,
        };

        // Each symbol gaining its first subscriber gets its reader started
        // inside the same critical section, so the reader set never diverges
        // from the index.
        for symbol in add.activated {
            match self.start_reader(&mut state, &symbol).await {
                Ok(()) => {}
                Err(reason) => {
                    let _ = state.index.remove(client, std::slice::from_ref(&symbol));
                    outcome.accepted.retain(|s| s != &symbol);
                    match reason {
                        StartReaderError::CapacityExceeded => {
                            tracing::warn!(%symbol, "symbol refused by global cap");
                        }
                        StartReaderError::Bus(e) => {
                            outcome.bus_unavailable = true;
                            tracing::warn!(%symbol, error = %e, "bus subscribe failed");
                        }
                    }
                }
            }
        }

        metrics::set_active_symbol_readers(state.readers.len() as f64);
        tracing::debug!(client, accepted = outcome.accepted.len(), "subscribe handled");
        outcome
    }

    /// Unsubscribe a client from symbols. Returns what was actually removed.
    pub async fn unsubscribe(&self, client: ClientId, symbols: &[Symbol]) -> Vec<Symbol> {
        let symbols = normalize_symbols(symbols);
        let mut state = self.state.lock().await;

        let outcome = state.index.remove(client, &symbols);
        self.stop_readers(&mut state, &outcome.deactivated).await;

        metrics::set_active_symbol_readers(state.readers.len() as f64);
        tracing::debug!(client, removed = outcome.removed.len(), "unsubscribe handled");
        outcome.removed
    }

    /// Remove a client and everything it subscribed to. Idempotent: a second
    /// call for the same client is a no-op.
    pub async fn disconnect(&self, client: ClientId) {
        let mut state = self.state.lock().await;

        let known = state.outboxes.remove(&client).is_some();
        let deactivated = state.index.remove_client(client);
        self.stop_readers(&mut state, &deactivated).await;

        if known {
            metrics::set_ws_clients(state.index.client_count() as f64);
            metrics::set_active_symbol_readers(state.readers.len() as f64);
            tracing::info!(client, "client disconnected");
        }
    }

    /// Symbols that currently have at least one subscriber.
    pub async fn active_symbols(&self) -> Vec<Symbol> {
        self.state.lock().await.index.active_symbols()
    }

    /// Symbols a client currently holds.
    pub async fn client_symbols(&self, client: ClientId) -> Vec<Symbol> {
        self.state.lock().await.index.client_symbols(client)
    }

    /// Whether a reader task is registered and still running for a symbol.
    pub async fn reader_running(&self, symbol: &str) -> bool {
        let state = self.state.lock().await;
        state
            .readers
            .get(symbol)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Registry statistics.
    pub async fn stats(&self) -> FanoutStats {
        let state = self.state.lock().await;
        FanoutStats {
            clients: state.index.client_count(),
            active_symbols: state.index.symbol_count(),
        }
    }

    /// The per-client symbol cap.
    #[must_use]
    pub const fn max_symbols_per_client(&self) -> usize {
        self.config.max_symbols_per_client
    }

    async fn start_reader(
        self: &Arc<Self>,
        state: &mut ManagerState,
        symbol: &Symbol,
    ) -> Result<(), StartReaderError> {
        // The upstream must carry any symbol a client is receiving.
        let ensured = self.upstream.ensure_symbols(std::slice::from_ref(symbol)).await;
        if !ensured.contains(symbol) {
            return Err(StartReaderError::CapacityExceeded);
        }

        let channel = symbol_channel(&self.config.channel_prefix, symbol);
        let reader = match self.bus.subscribe(&channel).await {
            Ok(reader) => reader,
            Err(e) => {
                self.upstream.release_symbols(std::slice::from_ref(symbol)).await;
                return Err(StartReaderError::Bus(e));
            }
        };

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(Arc::clone(self).reader_loop(
            symbol.clone(),
            reader,
            cancel.clone(),
        ));

        state.readers.insert(symbol.clone(), ReaderHandle { cancel, task });
        tracing::debug!(%symbol, "reader task started");
        Ok(())
    }

    async fn stop_readers(&self, state: &mut ManagerState, symbols: &[Symbol]) {
        for symbol in symbols {
            if let Some(handle) = state.readers.remove(symbol) {
                handle.cancel.cancel();
                tracing::debug!(%symbol, "reader task stopped");
            }
        }

        if !symbols.is_empty() {
            self.upstream.release_symbols(symbols).await;
        }
    }

    /// Per-symbol reader: polls the bus with a short timeout so cancellation
    /// is observed promptly, and fans each payload out to the subscribers
    /// registered at delivery time.
    async fn reader_loop(
        self: Arc<Self>,
        symbol: Symbol,
        mut reader: Box<dyn BusReader>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                result = reader.recv(self.config.poll_timeout) => match result {
                    Ok(Some(payload)) => self.fan_out(&symbol, &payload).await,
                    Ok(None) => {}
                    Err(BusError::Lagged(n)) => {
                        tracing::warn!(%symbol, lagged = n, "bus reader lagged");
                    }
                    Err(e) => {
                        // Bus gone: keep the subscriptions, stop expecting data.
                        tracing::warn!(%symbol, error = %e, "bus reader closed");
                        break;
                    }
                }
            }
        }

        tracing::debug!(%symbol, "reader loop exited");
    }

    async fn fan_out(&self, symbol: &str, payload: &str) {
        let tick: NormalizedTick = match serde_json::from_str(payload) {
            Ok(tick) => tick,
            Err(e) => {
                tracing::warn!(%symbol, error = %e, "dropping undecodable bus payload");
                return;
            }
        };

        // Snapshot the current subscribers, then send without the lock held.
        let targets: Vec<(ClientId, mpsc::Sender<Outbound>)> = {
            let state = self.state.lock().await;
            state
                .index
                .subscribers(symbol)
                .into_iter()
                .filter_map(|id| state.outboxes.get(&id).map(|tx| (id, tx.clone())))
                .collect()
        };

        let mut dead = Vec::new();
        let mut delivered = 0u64;

        for (client, tx) in targets {
            match tx.try_send(Outbound::Price(tick.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::record_tick_dropped(symbol);
                    tracing::debug!(client, %symbol, "client outbox full, tick dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(client),
            }
        }

        if delivered > 0 {
            metrics::record_ticks_delivered(symbol, delivered);
        }

        // A dead outbox means a dead session: remove the client from all of
        // its symbols, after the send iteration is done.
        for client in dead {
            tracing::info!(client, "client outbox closed, disconnecting");
            self.disconnect(client).await;
        }
    }
}

/// Uppercase, trim, drop empties, dedupe preserving request order.
fn normalize_symbols(symbols: &[Symbol]) -> Vec<Symbol> {
    let mut seen = std::collections::HashSet::new();
    symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
