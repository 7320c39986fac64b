#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quantboard Stream Proxy - Live Price Multiplexer
//!
//! A WebSocket proxy service that maintains a single combined-stream
//! connection to Binance and multiplexes normalized trade ticks to multiple
//! downstream clients through a named-channel bus.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no external dependencies
//!   - `tick`: the normalized trade record
//!   - `subscription`: the pure client↔symbol index
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: bus and upstream-control interfaces
//!   - `services`: subscription fan-out, price-alert evaluation
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: upstream combined-stream connector
//!   - `bus`: in-process named-channel broker
//!   - `ws`: client-facing WebSocket endpoint
//!   - `config`: configuration loading
//!   - `health`: health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Binance WS ──► Ingestor ──► Bus (prices:<SYMBOL>, prices:all)
//!                                  │
//!                     per-symbol reader tasks
//!                                  │
//!                        SubscriptionManager ──► Client 1..N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::subscription::{AddOutcome, ClientId, RemoveOutcome, SubscriptionIndex, Symbol};
pub use domain::tick::NormalizedTick;

// Ports
pub use application::ports::{Bus, BusError, BusReader, UpstreamControl};

// Services
pub use application::services::alerts::{AlertCondition, AlertEvaluator, AlertEvent, PriceAlert};
pub use application::services::fanout::{
    FanoutConfig, FanoutStats, Outbound, SubscribeOutcome, SubscriptionManager,
};

// Infrastructure config
pub use infrastructure::config::{
    BusSettings, ConfigError, ProxyConfig, ReconnectSettings, ServerSettings, StreamSettings,
};

// Bus adapter (for integration tests)
pub use infrastructure::bus::ChannelBus;

// Binance adapter
pub use infrastructure::binance::{
    IngestEvent, Ingestor, IngestorConfig, IngestorHandle, IngestorState,
};

// WebSocket server (for integration tests)
pub use infrastructure::ws::{WsServer, WsServerError, WsState};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
