//! Quantboard Stream Proxy Binary
//!
//! Starts the live price stream proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quantboard-stream-proxy
//! ```
//!
//! # Environment Variables (all optional)
//!
//! - `STREAM_ENABLED`: Master switch for live streaming (default: true)
//! - `BINANCE_WS_BASE`: Upstream WebSocket base URL (default: wss://stream.binance.com:9443)
//! - `STREAM_DEFAULT_SYMBOLS`: Comma-separated startup symbols (default: BTCUSDT,ETHUSDT)
//! - `STREAM_CHANNEL_PREFIX`: Bus channel prefix (default: prices)
//! - `STREAM_MAX_SYMBOLS_PER_CLIENT`: Per-client symbol cap (default: 20)
//! - `STREAM_MAX_TOTAL_SYMBOLS`: Global tracked symbol cap (default: 50)
//! - `STREAM_WS_PORT`: Client WebSocket port (default: 8000)
//! - `STREAM_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `STREAM_MAX_RECONNECT_ATTEMPTS`: Upstream retry budget (default: 5)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: quantboard-stream-proxy)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use quantboard_stream_proxy::infrastructure::binance::{
    IngestEvent, Ingestor, IngestorConfig, IngestorHandle,
};
use quantboard_stream_proxy::infrastructure::bus::ChannelBus;
use quantboard_stream_proxy::infrastructure::telemetry;
use quantboard_stream_proxy::infrastructure::ws::{WsServer, WsState};
use quantboard_stream_proxy::{
    FanoutConfig, HealthServer, HealthServerState, ProxyConfig, SubscriptionManager, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Quantboard Stream Proxy");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Initialize the bus decoupling ingestion from fan-out
    let bus = Arc::new(ChannelBus::new(config.bus.channel_capacity));

    // Initialize the upstream ingestor
    let ingestor_config = IngestorConfig {
        ws_base: config.stream.ws_base.clone(),
        channel_prefix: config.stream.channel_prefix.clone(),
        max_total_symbols: config.stream.max_total_symbols,
        reconnect: (&config.reconnect).into(),
    };
    let (event_tx, event_rx) = mpsc::channel::<IngestEvent>(256);
    let ingestor = Arc::new(Ingestor::new(
        ingestor_config,
        Arc::clone(&bus) as Arc<dyn quantboard_stream_proxy::Bus>,
        config.stream.default_symbols.clone(),
        event_tx,
        shutdown_token.clone(),
    ));

    // Initialize the subscription manager
    let fanout_config = FanoutConfig {
        channel_prefix: config.stream.channel_prefix.clone(),
        max_symbols_per_client: config.stream.max_symbols_per_client,
        poll_timeout: config.stream.poll_timeout,
        outbox_capacity: config.stream.outbox_capacity,
    };
    let manager = Arc::new(SubscriptionManager::new(
        Arc::clone(&bus) as Arc<dyn quantboard_stream_proxy::Bus>,
        Arc::new(IngestorHandle::new(Arc::clone(&ingestor))),
        fanout_config,
        shutdown_token.clone(),
    ));

    // Spawn ingest event handler
    tokio::spawn(handle_ingest_events(event_rx));

    // Spawn the ingestor (parks until it has symbols, streams otherwise)
    if config.stream.enabled {
        tokio::spawn(Arc::clone(&ingestor).run());
    } else {
        tracing::warn!("live streaming disabled by STREAM_ENABLED");
    }

    // Spawn the client WebSocket server
    let ws_state = Arc::new(WsState {
        manager: Arc::clone(&manager),
        default_symbols: config.stream.default_symbols.clone(),
        enabled: config.stream.enabled,
        shutdown: shutdown_token.clone(),
    });
    let ws_server = WsServer::new(config.server.ws_port, ws_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    });

    // Spawn the health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&ingestor),
        Arc::clone(&manager),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Stream proxy ready");

    await_shutdown(shutdown_token).await;
    bus.close();

    tracing::info!("Stream proxy stopped");
    Ok(())
}

/// Log lifecycle events from the ingestor.
async fn handle_ingest_events(mut rx: mpsc::Receiver<IngestEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            IngestEvent::Connected => {
                tracing::info!("upstream feed connected");
            }
            IngestEvent::Disconnected => {
                tracing::warn!("upstream feed disconnected");
            }
            IngestEvent::Reconnecting { attempt } => {
                tracing::info!(attempt, "upstream feed reconnecting");
            }
            IngestEvent::SymbolsChanged { tracked } => {
                tracing::info!(tracked, "tracked symbol set changed");
            }
            IngestEvent::Stopped => {
                tracing::error!("upstream feed stopped, service degraded until symbols change");
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        enabled = config.stream.enabled,
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        default_symbols = ?config.stream.default_symbols,
        max_symbols_per_client = config.stream.max_symbols_per_client,
        max_total_symbols = config.stream.max_total_symbols,
        "Configuration loaded"
    );
    tracing::debug!(
        ws_base = %config.stream.ws_base,
        channel_prefix = %config.stream.channel_prefix,
        "Upstream endpoint"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
