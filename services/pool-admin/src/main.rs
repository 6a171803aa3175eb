//! Account pool admin service
//!
//! Single-binary Rust service that:
//! 1. Loads the account pool and saved profiles from disk
//! 2. Refreshes expiring access tokens in the background
//! 3. Serves the admin command surface and the host credential pipeline
//! 4. Flushes the pool document on shutdown

mod admin;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::{PoolManager, PoolOptions, ProfileStore, spawn_refresh_task};
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use common::now_millis;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_auth::{AuthStore, HttpRefresher};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single token endpoint call.
const REFRESH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State for the health and metrics handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<PoolManager>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router: health, metrics and the admin routes behind a
/// concurrency limit of `max_connections`.
fn build_router(state: AppState, admin: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(build_admin_router(admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting account-pool-admin");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        pool_path = %config.pool.path.display(),
        provider = %config.auth.provider,
        token_endpoint = %config.auth.token_endpoint,
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .timeout(REFRESH_REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let mut refresher = HttpRefresher::new(
        client,
        config.auth.token_endpoint.clone(),
        config.auth.client_id.clone(),
    );
    if let Some(secret) = config.auth.client_secret.take() {
        refresher = refresher.with_client_secret(secret);
    }

    let pool = Arc::new(
        PoolManager::load(
            config.pool.path.clone(),
            Arc::new(refresher),
            PoolOptions {
                default_mode: config.pool.default_mode,
                refresh_margin_ms: config.refresh_margin_ms(),
            },
        )
        .await,
    );
    let auth = Arc::new(AuthStore::new(config.auth.store_path.clone()));
    let profiles = Arc::new(
        ProfileStore::load(
            config.pool.profiles_path.clone(),
            auth.clone(),
            config.auth.provider.clone(),
        )
        .await,
    );

    let refresh_task = spawn_refresh_task(
        pool.clone(),
        config.refresh_interval(),
        config.refresh_threshold(),
    );

    let admin_state = AdminState::new(pool.clone(), profiles, auth, config.auth.provider.clone());
    let app_state = AppState {
        pool: admin_state.pool().clone(),
        started_at: Instant::now(),
        prometheus,
    };
    let app = build_router(app_state, admin_state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    refresh_task.abort();

    pool.shutdown()
        .await
        .context("failed to flush account pool")?;

    info!("shutdown complete");
    Ok(())
}

/// Pool health: 200 while at least one account is usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health(now_millis()).await;
    let status_code = match body["status"].as_str() {
        Some("healthy") | Some("degraded") => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    body["uptime_seconds"] = serde_json::json!(state.started_at.elapsed().as_secs());

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
