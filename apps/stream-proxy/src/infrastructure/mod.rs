//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Binance WebSocket ingestion adapter.
pub mod binance;

/// In-process named-channel bus adapter.
pub mod bus;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Client-facing WebSocket endpoint.
pub mod ws;
