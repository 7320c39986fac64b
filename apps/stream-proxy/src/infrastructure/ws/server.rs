//! WebSocket Server
//!
//! Axum router and listener for the client-facing price stream endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::fanout::SubscriptionManager;
use crate::domain::subscription::Symbol;
use crate::infrastructure::ws::session;

// =============================================================================
// Shared State
// =============================================================================

/// Shared state for WebSocket sessions.
pub struct WsState {
    /// The fan-out engine all sessions register with.
    pub manager: Arc<SubscriptionManager>,
    /// Symbols a client gets when it connects without a symbol list.
    pub default_symbols: Vec<Symbol>,
    /// When false, connections are accepted, told streaming is off, and
    /// closed.
    pub enabled: bool,
    /// Process shutdown signal.
    pub shutdown: CancellationToken,
}

// =============================================================================
// Router
// =============================================================================

#[derive(Debug, Deserialize)]
struct PricesQuery {
    /// Comma-separated initial symbol list.
    symbols: Option<String>,
}

/// Build the WebSocket router.
pub fn router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/ws/prices", get(prices_handler))
        .with_state(state)
}

async fn prices_handler(
    State(state): State<Arc<WsState>>,
    Query(query): Query<PricesQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let initial_symbols = parse_symbol_list(query.symbols.as_deref());
    ws.on_upgrade(move |socket| session::run(socket, state, initial_symbols))
}

/// Parse a comma-separated symbol list into normalized symbols.
fn parse_symbol_list(raw: Option<&str>) -> Vec<Symbol> {
    raw.map(|s| {
        s.split(',')
            .map(|part| part.trim().to_uppercase())
            .filter(|part| !part.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

// =============================================================================
// Server
// =============================================================================

/// WebSocket server errors.
#[derive(Debug, thiserror::Error)]
pub enum WsServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

/// The client-facing WebSocket server.
pub struct WsServer {
    port: u16,
    state: Arc<WsState>,
    cancel: CancellationToken,
}

impl WsServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<WsState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `WsServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), WsServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WsServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "WebSocket server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| WsServerError::ServerFailed(e.to_string()))?;

        tracing::info!("WebSocket server stopped");
        Ok(())
    }
}
