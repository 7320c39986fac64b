//! Prometheus Metrics
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: counts of ticks received, published, delivered, and dropped
//! - **Connections**: WebSocket client counts and upstream reconnects
//! - **Subscriptions**: active symbol readers and tracked symbols
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "stream_proxy_ticks_received_total",
        "Total ticks received from the upstream exchange"
    );
    describe_counter!(
        "stream_proxy_ticks_published_total",
        "Total ticks published to the bus"
    );
    describe_counter!(
        "stream_proxy_ticks_delivered_total",
        "Total price frames delivered to clients"
    );
    describe_counter!(
        "stream_proxy_ticks_dropped_total",
        "Total price frames dropped due to slow clients"
    );
    describe_counter!(
        "stream_proxy_decode_errors_total",
        "Total upstream frames dropped as undecodable"
    );
    describe_counter!(
        "stream_proxy_reconnects_total",
        "Total upstream reconnection attempts"
    );

    describe_gauge!(
        "stream_proxy_ws_clients",
        "Number of connected WebSocket clients"
    );
    describe_gauge!(
        "stream_proxy_active_symbol_readers",
        "Number of running per-symbol bus reader tasks"
    );
    describe_gauge!(
        "stream_proxy_tracked_symbols",
        "Number of symbols on the upstream connection"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a tick received from the upstream exchange.
pub fn record_tick_received(symbol: &str) {
    counter!(
        "stream_proxy_ticks_received_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

/// Record a tick published to the bus.
pub fn record_tick_published(symbol: &str) {
    counter!(
        "stream_proxy_ticks_published_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

/// Record price frames delivered to clients.
pub fn record_ticks_delivered(symbol: &str, count: u64) {
    counter!(
        "stream_proxy_ticks_delivered_total",
        "symbol" => symbol.to_string()
    )
    .increment(count);
}

/// Record a price frame dropped because a client outbox was full.
pub fn record_tick_dropped(symbol: &str) {
    counter!(
        "stream_proxy_ticks_dropped_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

/// Record an undecodable upstream frame.
pub fn record_decode_error() {
    counter!("stream_proxy_decode_errors_total").increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("stream_proxy_reconnects_total").increment(1);
}

/// Update the connected WebSocket client count.
pub fn set_ws_clients(count: f64) {
    gauge!("stream_proxy_ws_clients").set(count);
}

/// Update the running per-symbol reader task count.
pub fn set_active_symbol_readers(count: f64) {
    gauge!("stream_proxy_active_symbol_readers").set(count);
}

/// Update the tracked symbol count.
pub fn set_tracked_symbols(count: f64) {
    gauge!("stream_proxy_tracked_symbols").set(count);
}
