//! Price Alert Evaluator
//!
//! An example external consumer of the tick stream: watches the aggregate
//! bus channel, holds the last-seen price per symbol, and fires user-defined
//! threshold alerts with a cooldown window between repeats.
//!
//! This service uses nothing but the [`Bus`] port; it is the reference
//! pattern for integrators who want the same tick stream without touching
//! the fan-out core.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Bus, BusError, aggregate_channel};
use crate::domain::subscription::Symbol;
use crate::domain::tick::NormalizedTick;

// =============================================================================
// Alert Types
// =============================================================================

/// Condition for a price alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCondition {
    /// Fires while the price is at or above the target.
    Above,
    /// Fires while the price is at or below the target.
    Below,
    /// Fires when the price crosses the target in either direction.
    Cross,
}

/// A user-defined price alert.
#[derive(Debug, Clone)]
pub struct PriceAlert {
    /// Alert identifier.
    pub id: u64,
    /// Symbol the alert watches.
    pub symbol: Symbol,
    /// Trigger condition.
    pub condition: AlertCondition,
    /// Target price.
    pub target_price: Decimal,
    /// Minimum interval between consecutive firings.
    pub cooldown: Duration,
}

/// Emitted when an alert fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    /// The alert that fired.
    pub alert_id: u64,
    /// Symbol the alert watches.
    pub symbol: Symbol,
    /// Price that triggered the alert.
    pub price: Decimal,
    /// When the alert fired.
    pub fired_at: DateTime<Utc>,
}

/// Evaluate a condition against the current price and the previous one.
///
/// `Cross` needs a previous price; with none it never fires.
#[must_use]
pub fn condition_met(
    condition: AlertCondition,
    target: Decimal,
    current: Decimal,
    last: Option<Decimal>,
) -> bool {
    match condition {
        AlertCondition::Above => current >= target,
        AlertCondition::Below => current <= target,
        AlertCondition::Cross => last.is_some_and(|last| {
            let crossed_up = last < target && target <= current;
            let crossed_down = last > target && target >= current;
            crossed_up || crossed_down
        }),
    }
}

// =============================================================================
// Alert Evaluator
// =============================================================================

/// Evaluates registered alerts against the live tick stream.
pub struct AlertEvaluator {
    bus: Arc<dyn Bus>,
    channel_prefix: String,
    poll_timeout: Duration,
    alerts: RwLock<Vec<PriceAlert>>,
    event_tx: mpsc::Sender<AlertEvent>,
    cancel: CancellationToken,
}

impl AlertEvaluator {
    /// Create a new evaluator publishing fired alerts on `event_tx`.
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        channel_prefix: String,
        event_tx: mpsc::Sender<AlertEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            channel_prefix,
            poll_timeout: Duration::from_secs(1),
            alerts: RwLock::new(Vec::new()),
            event_tx,
            cancel,
        }
    }

    /// Register an alert.
    pub fn add_alert(&self, alert: PriceAlert) {
        self.alerts.write().push(alert);
    }

    /// Remove an alert by id.
    pub fn remove_alert(&self, id: u64) {
        self.alerts.write().retain(|a| a.id != id);
    }

    /// Number of registered alerts.
    #[must_use]
    pub fn alert_count(&self) -> usize {
        self.alerts.read().len()
    }

    /// Run until cancelled or the bus becomes unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if subscribing to the aggregate channel fails.
    pub async fn run(self: Arc<Self>) -> Result<(), BusError> {
        let channel = aggregate_channel(&self.channel_prefix);
        let mut reader = self.bus.subscribe(&channel).await?;

        let mut last_prices: HashMap<Symbol, Decimal> = HashMap::new();
        let mut last_fired: HashMap<u64, DateTime<Utc>> = HashMap::new();

        tracing::info!(channel = %channel, "alert evaluator started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                result = reader.recv(self.poll_timeout) => match result {
                    Ok(Some(payload)) => {
                        self.process_payload(&payload, &mut last_prices, &mut last_fired).await;
                    }
                    Ok(None) => {}
                    Err(BusError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "alert evaluator lagged");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "alert evaluator lost the bus");
                        break;
                    }
                }
            }
        }

        tracing::info!("alert evaluator stopped");
        Ok(())
    }

    async fn process_payload(
        &self,
        payload: &str,
        last_prices: &mut HashMap<Symbol, Decimal>,
        last_fired: &mut HashMap<u64, DateTime<Utc>>,
    ) {
        let tick: NormalizedTick = match serde_json::from_str(payload) {
            Ok(tick) => tick,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable tick payload");
                return;
            }
        };

        let last = last_prices.insert(tick.symbol.clone(), tick.price);
        let now = Utc::now();

        let due: Vec<PriceAlert> = {
            let alerts = self.alerts.read();
            alerts
                .iter()
                .filter(|alert| alert.symbol == tick.symbol)
                .filter(|alert| condition_met(alert.condition, alert.target_price, tick.price, last))
                .filter(|alert| cooldown_elapsed(last_fired.get(&alert.id).copied(), alert.cooldown, now))
                .cloned()
                .collect()
        };

        for alert in due {
            last_fired.insert(alert.id, now);
            let event = AlertEvent {
                alert_id: alert.id,
                symbol: alert.symbol,
                price: tick.price,
                fired_at: now,
            };
            tracing::info!(alert_id = event.alert_id, symbol = %event.symbol, price = %event.price, "price alert fired");
            let _ = self.event_tx.send(event).await;
        }
    }
}

fn cooldown_elapsed(last_fired: Option<DateTime<Utc>>, cooldown: Duration, now: DateTime<Utc>) -> bool {
    last_fired.is_none_or(|fired| {
        let elapsed = now.signed_duration_since(fired);
        elapsed >= chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX)
    })
}

// =============================================================================
// Tests
// =============================================================================
