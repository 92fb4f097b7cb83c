//! Market Stream Binary
//!
//! Runs one market data session for a configured instrument list and logs
//! the stream.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_STREAM_URL`: Gateway base URL (e.g. `wss://api.example.com`)
//!
//! ## Optional
//! - `MARKET_STREAM_TOKEN`: Access token
//! - `MARKET_STREAM_TOKEN_FILE`: File holding the access token (re-read on connect)
//! - `MARKET_STREAM_INSTRUMENTS`: Comma-separated instrument keys to watch
//! - `MARKET_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `MARKET_STREAM_HEARTBEAT_INTERVAL_SECS`: Keep-alive interval (default: 30)
//! - `MARKET_STREAM_IDLE_TIMEOUT_SECS`: Inbound silence before reconnect (default: 90)
//! - `MARKET_STREAM_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 500)
//! - `MARKET_STREAM_RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 30)
//! - `MARKET_STREAM_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `MARKET_STREAM_MAX_RECONNECT_ATTEMPTS`: 0 = unlimited (default: 0)
//! - `MARKET_STREAM_TICK_CHANNEL_CAPACITY`: Tick update buffer (default: 4096)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-stream)
//! - `RUST_LOG`: Log filter (default: `market_stream=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream::infrastructure::telemetry;
use market_stream::{
    HealthServer, HealthServerState, MarketSession, StreamConfig, WebSocketConnector,
    init_metrics, token_source,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting market stream");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = StreamConfig::from_env().context("failed to load configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let connector = Arc::new(WebSocketConnector::new(config.endpoint.clone()));
    let session = Arc::new(MarketSession::new(config.session_config(), connector));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        session.status_updates(),
        session.cache(),
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

    tokio::spawn(log_ticks(Arc::clone(&session), shutdown_token.clone()));
    tokio::spawn(log_status(Arc::clone(&session), shutdown_token.clone()));

    let consumer = session.register_consumer();
    let delta = session.watch(consumer, config.instruments.iter())?;
    tracing::info!(instruments = delta.added.len(), "Watching instruments");

    if let Err(e) = session.connect_from(token_source(&config.token).as_ref()) {
        tracing::error!(error = %e, "Failed to load access token");
    }

    tracing::info!("Market stream ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, session.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Session did not stop within the shutdown timeout");
    }

    tracing::info!("Market stream stopped");
    Ok(())
}

/// Log every applied tick at debug level.
async fn log_ticks(session: Arc<MarketSession>, cancel: CancellationToken) {
    let mut updates = session.tick_updates();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            update = updates.recv() => match update {
                Ok(update) => {
                    tracing::debug!(
                        instrument = %update.key,
                        ltp = ?update.tick.ltp,
                        change_percent = ?update.tick.change_percent(),
                        "Tick"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Tick logger lagging");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Log session state changes and surfaced errors.
async fn log_status(session: Arc<MarketSession>, cancel: CancellationToken) {
    let mut status = session.status_updates();
    let mut errors = session.errors();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                tracing::info!(
                    session = snapshot.session.as_str(),
                    connection = snapshot.connection.as_str(),
                    market = snapshot.market_status.as_str(),
                    watched = snapshot.watched,
                    reconnect_attempts = snapshot.reconnect_attempts,
                    "Session status"
                );
            }
            error = errors.recv() => match error {
                Ok(error) => tracing::error!(error = %error, "Session error"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed session errors"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
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

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        endpoint = %config.endpoint.as_str(),
        instruments = config.instruments.len(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_secs = config.websocket.heartbeat_interval.as_secs(),
        idle_timeout_secs = config.websocket.idle_timeout.as_secs(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        token = ?config.token,
        "Connection settings"
    );
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

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
