//! Admin API for session management
//!
//! Runs on a separate listener and is disabled unless `[admin]` is
//! configured. Bind it to loopback; it installs credentials.
//!
//! Endpoints:
//! - GET    /admin/session        : session status, never exposes tokens
//! - POST   /admin/session        : install a credential (login)
//! - DELETE /admin/session        : clear the credential (logout)
//! - POST   /admin/session/refresh: force a coordinated refresh

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use session_client::Dispatcher;
use tracing::{error, info, warn};

use crate::metrics;
use crate::proxy::error_response;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    dispatcher: Dispatcher,
}

impl AdminState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

/// Request body for POST /admin/session
#[derive(Debug, Deserialize)]
struct LoginRequest {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<serde_json::Value>,
}

/// Build the admin axum router with all session endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/admin/session",
            get(session_status).post(login).delete(logout),
        )
        .route("/admin/session/refresh", post(force_refresh))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn admin_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// GET /admin/session: whether a credential is held, plus the user record.
async fn session_status(State(state): State<AdminState>) -> Response {
    let credential = state.dispatcher.credentials();
    let refreshing = state.dispatcher.coordinator().is_refreshing().await;

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "authenticated": credential.is_authenticated(),
            "has_refresh_token": credential.refresh_token().is_some(),
            "refreshing": refreshing,
            "user": credential.user,
        }),
    )
}

/// POST /admin/session: replace the stored credential.
async fn login(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<LoginRequest>,
) -> Response {
    if body.token.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "token must not be empty",
            &admin_request_id(),
        );
    }

    let has_refresh = body.refresh_token.is_some();
    let store = state.dispatcher.coordinator().store();
    if let Err(e) = store.login(body.token, body.refresh_token, body.user).await {
        error!(error = %e, "failed to persist login");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            &e.to_string(),
            &admin_request_id(),
        );
    }

    metrics::set_session_authenticated(true);
    info!(has_refresh, "session installed via admin API");
    json_response(StatusCode::OK, serde_json::json!({ "status": "logged_in" }))
}

/// DELETE /admin/session: clear the credential. Idempotent.
async fn logout(State(state): State<AdminState>) -> Response {
    match state.dispatcher.clear().await {
        Ok(()) => {
            info!("session cleared via admin API");
            json_response(StatusCode::OK, serde_json::json!({ "status": "logged_out" }))
        }
        Err(e) => {
            error!(error = %e, "failed to clear session");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                &e.to_string(),
                &admin_request_id(),
            )
        }
    }
}

/// POST /admin/session/refresh: refresh now, joining any in-flight refresh.
///
/// A failed refresh terminates the session exactly as it would for a
/// proxied request.
async fn force_refresh(State(state): State<AdminState>) -> Response {
    match state.dispatcher.coordinator().refresh().await {
        Ok(credential) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "refreshed",
                "authenticated": credential.is_authenticated(),
            }),
        ),
        Err(e) => {
            warn!(error = %e, "forced refresh failed");
            error_response(
                StatusCode::UNAUTHORIZED,
                "session_terminated",
                &e.to_string(),
                &admin_request_id(),
            )
        }
    }
}
