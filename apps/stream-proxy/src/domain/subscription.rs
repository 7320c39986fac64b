//! Subscription Index
//!
//! Pure state for tracking which client subscribes to which symbols.
//! Maintains both directions of the relation so subscribe/unsubscribe can be
//! answered from the client side and fan-out from the symbol side, and keeps
//! the two maps in lock-step: the only mutation paths are [`SubscriptionIndex::add`],
//! [`SubscriptionIndex::remove`], and [`SubscriptionIndex::remove_client`].
//!
//! # Design
//!
//! The index itself is not synchronized; the owning manager wraps it in a
//! single mutex so every logical operation mutates it atomically. Each
//! mutation reports the symbols whose subscriber count crossed zero, which is
//! what drives reader-task and upstream lifecycle.

use std::collections::{HashMap, HashSet};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a connected client.
pub type ClientId = u64;

/// A symbol string (e.g. `BTCUSDT`).
pub type Symbol = String;

/// Result of an add operation.
#[derive(Debug, Clone, Default)]
pub struct AddOutcome {
    /// Symbols actually added to the client (cap-clipped, deduplicated).
    pub added: Vec<Symbol>,
    /// Symbols that gained their first subscriber.
    pub activated: Vec<Symbol>,
}

/// Result of a remove operation.
#[derive(Debug, Clone, Default)]
pub struct RemoveOutcome {
    /// Symbols actually removed from the client.
    pub removed: Vec<Symbol>,
    /// Symbols that lost their last subscriber.
    pub deactivated: Vec<Symbol>,
}

// =============================================================================
// Subscription Index
// =============================================================================

/// Two-sided client/symbol subscription index.
///
/// Invariants upheld after every operation:
///
/// - `client ∈ symbol_clients[s]` iff `s ∈ client_symbols[client]`
/// - `client_symbols[client].len() <= max_symbols_per_client`
/// - no entry in `symbol_clients` has an empty subscriber set
#[derive(Debug)]
pub struct SubscriptionIndex {
    client_symbols: HashMap<ClientId, HashSet<Symbol>>,
    symbol_clients: HashMap<Symbol, HashSet<ClientId>>,
    max_symbols_per_client: usize,
}

impl SubscriptionIndex {
    /// Create an empty index with the given per-client symbol cap.
    #[must_use]
    pub fn new(max_symbols_per_client: usize) -> Self {
        Self {
            client_symbols: HashMap::new(),
            symbol_clients: HashMap::new(),
            max_symbols_per_client,
        }
    }

    /// Register a client with an empty symbol set.
    ///
    /// Registering an already-known client is a no-op.
    pub fn register(&mut self, client: ClientId) {
        self.client_symbols.entry(client).or_default();
    }

    /// Check whether a client is registered.
    #[must_use]
    pub fn is_registered(&self, client: ClientId) -> bool {
        self.client_symbols.contains_key(&client)
    }

    /// Subscribe a client to symbols.
    ///
    /// Requests beyond the per-client cap are clipped, never accepted; the
    /// outcome reports exactly what was added. Unknown clients add nothing.
    pub fn add(&mut self, client: ClientId, symbols: &[Symbol]) -> AddOutcome {
        let Some(client_set) = self.client_symbols.get_mut(&client) else {
            return AddOutcome::default();
        };

        let mut outcome = AddOutcome::default();

        for symbol in symbols {
            if client_set.contains(symbol) {
                continue;
            }
            if client_set.len() >= self.max_symbols_per_client {
                break;
            }

            client_set.insert(symbol.clone());
            let subscribers = self.symbol_clients.entry(symbol.clone()).or_default();
            subscribers.insert(client);

            if subscribers.len() == 1 {
                outcome.activated.push(symbol.clone());
            }
            outcome.added.push(symbol.clone());
        }

        outcome
    }

    /// Unsubscribe a client from symbols.
    ///
    /// Symbols the client never held are ignored.
    pub fn remove(&mut self, client: ClientId, symbols: &[Symbol]) -> RemoveOutcome {
        let Some(client_set) = self.client_symbols.get_mut(&client) else {
            return RemoveOutcome::default();
        };

        let mut outcome = RemoveOutcome::default();

        for symbol in symbols {
            if !client_set.remove(symbol) {
                continue;
            }
            outcome.removed.push(symbol.clone());

            if let Some(subscribers) = self.symbol_clients.get_mut(symbol) {
                subscribers.remove(&client);
                if subscribers.is_empty() {
                    self.symbol_clients.remove(symbol);
                    outcome.deactivated.push(symbol.clone());
                }
            }
        }

        outcome
    }

    /// Remove a client and all of its subscriptions.
    ///
    /// Returns the symbols left without any subscriber. Safe to call for an
    /// unknown client.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<Symbol> {
        let Some(client_set) = self.client_symbols.remove(&client) else {
            return vec![];
        };

        let mut deactivated = Vec::new();

        for symbol in &client_set {
            if let Some(subscribers) = self.symbol_clients.get_mut(symbol) {
                subscribers.remove(&client);
                if subscribers.is_empty() {
                    self.symbol_clients.remove(symbol);
                    deactivated.push(symbol.clone());
                }
            }
        }

        deactivated
    }

    /// Get the symbols a client currently holds.
    #[must_use]
    pub fn client_symbols(&self, client: ClientId) -> Vec<Symbol> {
        self.client_symbols
            .get(&client)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the clients subscribed to a symbol.
    #[must_use]
    pub fn subscribers(&self, symbol: &str) -> Vec<ClientId> {
        self.symbol_clients
            .get(symbol)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Get all symbols with at least one subscriber.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.symbol_clients.keys().cloned().collect()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.client_symbols.len()
    }

    /// Number of symbols with at least one subscriber.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symbol_clients.len()
    }

    /// The per-client symbol cap.
    #[must_use]
    pub const fn max_symbols_per_client(&self) -> usize {
        self.max_symbols_per_client
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn add_first_subscriber_activates_symbol() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);

        let outcome = index.add(1, &syms(&["BTCUSDT"]));

        assert_eq!(outcome.added, syms(&["BTCUSDT"]));
        assert_eq!(outcome.activated, syms(&["BTCUSDT"]));
    }

    #[test]
    fn add_second_subscriber_activates_nothing() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);
        index.register(2);

        index.add(1, &syms(&["BTCUSDT"]));
        let outcome = index.add(2, &syms(&["BTCUSDT"]));

        assert_eq!(outcome.added, syms(&["BTCUSDT"]));
        assert!(outcome.activated.is_empty());
    }

    #[test]
    fn add_duplicate_is_ignored() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);

        index.add(1, &syms(&["BTCUSDT"]));
        let outcome = index.add(1, &syms(&["BTCUSDT"]));

        assert!(outcome.added.is_empty());
        assert!(outcome.activated.is_empty());
        assert_eq!(index.client_symbols(1).len(), 1);
    }

    #[test]
    fn add_unregistered_client_is_noop() {
        let mut index = SubscriptionIndex::new(20);

        let outcome = index.add(7, &syms(&["BTCUSDT"]));

        assert!(outcome.added.is_empty());
        assert_eq!(index.symbol_count(), 0);
    }

    #[test]
    fn add_clips_at_per_client_cap() {
        let mut index = SubscriptionIndex::new(2);
        index.register(1);

        let requested = syms(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]);
        let outcome = index.add(1, &requested);

        assert_eq!(outcome.added.len(), 2);
        assert_eq!(index.client_symbols(1).len(), 2);

        // Further adds are fully rejected once at the cap.
        let outcome = index.add(1, &syms(&["EUSDT"]));
        assert!(outcome.added.is_empty());
    }

    #[test]
    fn cap_clip_counts_existing_subscriptions() {
        let mut index = SubscriptionIndex::new(3);
        index.register(1);

        index.add(1, &syms(&["AUSDT", "BUSDT"]));
        let outcome = index.add(1, &syms(&["CUSDT", "DUSDT"]));

        assert_eq!(outcome.added, syms(&["CUSDT"]));
        assert_eq!(index.client_symbols(1).len(), 3);
    }

    #[test]
    fn remove_last_subscriber_deactivates_symbol() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);
        index.add(1, &syms(&["BTCUSDT"]));

        let outcome = index.remove(1, &syms(&["BTCUSDT"]));

        assert_eq!(outcome.removed, syms(&["BTCUSDT"]));
        assert_eq!(outcome.deactivated, syms(&["BTCUSDT"]));
        assert_eq!(index.symbol_count(), 0);
    }

    #[test]
    fn remove_with_remaining_subscriber_keeps_symbol_active() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);
        index.register(2);
        index.add(1, &syms(&["BTCUSDT"]));
        index.add(2, &syms(&["BTCUSDT"]));

        let outcome = index.remove(1, &syms(&["BTCUSDT"]));

        assert_eq!(outcome.removed, syms(&["BTCUSDT"]));
        assert!(outcome.deactivated.is_empty());
        assert_eq!(index.subscribers("BTCUSDT"), vec![2]);
    }

    #[test]
    fn remove_unheld_symbol_is_ignored() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);
        index.add(1, &syms(&["BTCUSDT"]));

        let outcome = index.remove(1, &syms(&["ETHUSDT"]));

        assert!(outcome.removed.is_empty());
        assert!(outcome.deactivated.is_empty());
    }

    #[test]
    fn remove_client_deactivates_orphaned_symbols_only() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);
        index.register(2);
        index.add(1, &syms(&["BTCUSDT", "ETHUSDT"]));
        index.add(2, &syms(&["BTCUSDT"]));

        let mut deactivated = index.remove_client(1);
        deactivated.sort();

        assert_eq!(deactivated, syms(&["ETHUSDT"]));
        assert!(!index.is_registered(1));
        assert_eq!(index.subscribers("BTCUSDT"), vec![2]);
    }

    #[test]
    fn remove_client_twice_is_idempotent() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);
        index.add(1, &syms(&["BTCUSDT"]));

        let first = index.remove_client(1);
        let second = index.remove_client(1);

        assert_eq!(first, syms(&["BTCUSDT"]));
        assert!(second.is_empty());
    }

    #[test]
    fn indices_stay_inverse() {
        let mut index = SubscriptionIndex::new(20);
        index.register(1);
        index.register(2);
        index.add(1, &syms(&["BTCUSDT", "ETHUSDT"]));
        index.add(2, &syms(&["ETHUSDT", "BNBUSDT"]));
        index.remove(1, &syms(&["BTCUSDT"]));

        for symbol in index.active_symbols() {
            for client in index.subscribers(&symbol) {
                assert!(index.client_symbols(client).contains(&symbol));
            }
        }
        for client in [1, 2] {
            for symbol in index.client_symbols(client) {
                assert!(index.subscribers(&symbol).contains(&client));
            }
        }
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        #[derive(Debug, Clone)]
        enum Op {
            Register(ClientId),
            Add(ClientId, Vec<Symbol>),
            Remove(ClientId, Vec<Symbol>),
            RemoveClient(ClientId),
        }

        fn symbol_strategy() -> impl Strategy<Value = Symbol> {
            prop::sample::select(vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "BNBUSDT".to_string(),
                "SOLUSDT".to_string(),
                "XRPUSDT".to_string(),
            ])
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            let client = 0..4u64;
            prop_oneof![
                client.clone().prop_map(Op::Register),
                (client.clone(), prop::collection::vec(symbol_strategy(), 1..4))
                    .prop_map(|(c, s)| Op::Add(c, s)),
                (client.clone(), prop::collection::vec(symbol_strategy(), 1..4))
                    .prop_map(|(c, s)| Op::Remove(c, s)),
                client.prop_map(Op::RemoveClient),
            ]
        }

        proptest! {
            #[test]
            fn random_ops_preserve_invariants(ops in prop::collection::vec(op_strategy(), 0..64)) {
                let cap = 3;
                let mut index = SubscriptionIndex::new(cap);

                for op in ops {
                    match op {
                        Op::Register(c) => index.register(c),
                        Op::Add(c, s) => {
                            index.add(c, &s);
                        }
                        Op::Remove(c, s) => {
                            index.remove(c, &s);
                        }
                        Op::RemoveClient(c) => {
                            index.remove_client(c);
                        }
                    }

                    // Per-client cap never exceeded.
                    for client in 0..4u64 {
                        prop_assert!(index.client_symbols(client).len() <= cap);
                    }

                    // Two maps are exactly inverse; no empty subscriber sets.
                    for symbol in index.active_symbols() {
                        let subs = index.subscribers(&symbol);
                        prop_assert!(!subs.is_empty());
                        for client in subs {
                            prop_assert!(index.client_symbols(client).contains(&symbol));
                        }
                    }
                    for client in 0..4u64 {
                        for symbol in index.client_symbols(client) {
                            prop_assert!(index.subscribers(&symbol).contains(&client));
                        }
                    }
                }
            }
        }
    }
}
