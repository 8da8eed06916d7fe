//! Session proxy
//!
//! Single-binary service that:
//! 1. Restores the persisted session from disk
//! 2. Listens for local requests
//! 3. Attaches the session's access token, refreshing it once on a 401
//! 4. Proxies to the configured upstream API

mod admin;
mod config;
mod metrics;
mod proxy;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use session_client::{CredentialStore, Dispatcher, SessionEvent};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::proxy::ProxyState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrently handled requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
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

    info!("starting session-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
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

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        credentials_path = %config.session.credentials_path.display(),
        admin_enabled = config.admin.is_some(),
        "configuration loaded"
    );

    let store = CredentialStore::load(config.session.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credentials at {}",
                config.session.credentials_path.display()
            )
        })?;
    let authenticated = store.get().is_authenticated();
    metrics::set_session_authenticated(authenticated);
    info!(authenticated, "session restored");

    let dispatcher = Dispatcher::new(Arc::new(store), config.client_config());
    let events = spawn_event_logger(dispatcher.subscribe());

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        dispatcher: dispatcher.clone(),
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Both listeners drain on the same signal. The drain timeout starts when
    // the signal fires, not when the server starts.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = match &config.admin {
        Some(admin) => {
            let admin_listener = TcpListener::bind(admin.listen_addr)
                .await
                .with_context(|| format!("failed to bind admin API to {}", admin.listen_addr))?;
            info!(addr = %admin.listen_addr, "admin API listening");
            let admin_app = build_admin_router(AdminState::new(dispatcher.clone()));
            let mut rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = rx.changed().await;
                    })
                    .await
            }))
        }
        None => None,
    };

    info!(addr = %listen_addr, "accepting requests");

    let in_flight = metrics.in_flight.clone();
    let mut rx = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;

    // Signal both servers to begin draining
    let _ = shutdown_tx.send(true);

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
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(handle) = admin_handle {
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "admin server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "admin server task panicked"),
            Err(_) => warn!("admin API did not drain in time"),
        }
    }

    events.abort();
    info!("shutdown complete");
    Ok(())
}

/// Log session lifecycle events and mirror them into metrics.
fn spawn_event_logger(
    mut events: broadcast::Receiver<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => observe_session_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn observe_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Refreshed => {
            info!("session refreshed");
            metrics::record_session_event("refreshed");
            metrics::set_session_authenticated(true);
        }
        SessionEvent::Terminated { reason } => {
            warn!(%reason, "session terminated, log in again through the admin API");
            metrics::record_session_event("terminated");
            metrics::set_session_authenticated(false);
        }
        SessionEvent::LoggedOut => {
            info!("session logged out");
            metrics::record_session_event("logged_out");
            metrics::set_session_authenticated(false);
        }
    }
}

/// Health endpoint: status, session state, uptime, requests served.
/// Returns 200 while a credential is held, 503 (degraded) without one.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let authenticated = state.proxy.dispatcher.credentials().is_authenticated();

    let (status_code, status) = if authenticated {
        (axum::http::StatusCode::OK, "healthy")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = serde_json::json!({
        "status": status,
        "authenticated": authenticated,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all non-health requests to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
