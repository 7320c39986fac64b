//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, and
//! Prometheus metrics. Used by container orchestrators, load balancers, and
//! monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks the upstream feed)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::fanout::SubscriptionManager;
use crate::infrastructure::binance::{Ingestor, IngestorState};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed status.
    pub upstream: UpstreamInfo,
    /// Connected client count.
    pub clients: ClientStatus,
    /// Subscription statistics.
    pub subscriptions: SubscriptionStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Streaming and serving.
    Healthy,
    /// Partially functional (reconnecting, or idle with no symbols).
    Degraded,
    /// Upstream stopped while symbols are tracked.
    Unhealthy,
}

/// Upstream feed status.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    /// Connection state.
    pub state: String,
    /// Whether the feed is streaming.
    pub connected: bool,
    /// Symbols on the upstream connection.
    pub tracked_symbols: usize,
}

/// Connected client information.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Total connected WebSocket clients.
    pub total: usize,
}

/// Subscription statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    /// Symbols with at least one subscriber.
    pub active_symbols: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    ingestor: Arc<Ingestor>,
    manager: Arc<SubscriptionManager>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, ingestor: Arc<Ingestor>, manager: Arc<SubscriptionManager>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            ingestor,
            manager,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.ingestor.state() == IngestorState::Streaming {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let upstream_state = state.ingestor.state();
    let tracked = state.ingestor.tracked_count();
    let stats = state.manager.stats().await;

    HealthResponse {
        status: determine_health_status(upstream_state, tracked),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream: UpstreamInfo {
            state: state_to_string(upstream_state),
            connected: upstream_state == IngestorState::Streaming,
            tracked_symbols: tracked,
        },
        clients: ClientStatus {
            total: stats.clients,
        },
        subscriptions: SubscriptionStatus {
            active_symbols: stats.active_symbols,
        },
    }
}

fn state_to_string(state: IngestorState) -> String {
    match state {
        IngestorState::Stopped => "stopped".to_string(),
        IngestorState::Connecting => "connecting".to_string(),
        IngestorState::Streaming => "streaming".to_string(),
        IngestorState::Reconnecting => "reconnecting".to_string(),
    }
}

const fn determine_health_status(state: IngestorState, tracked_symbols: usize) -> HealthStatus {
    match state {
        IngestorState::Streaming => HealthStatus::Healthy,
        IngestorState::Connecting | IngestorState::Reconnecting => HealthStatus::Degraded,
        IngestorState::Stopped => {
            // Stopped with nothing tracked is idle; with symbols it means the
            // retry budget ran out.
            if tracked_symbols == 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            }
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
