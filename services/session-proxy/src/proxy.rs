//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers and the caller's own
//! credentials, and forwards them upstream through the session dispatcher,
//! which attaches the session token and handles refresh. Upstream responses
//! are returned verbatim (including error status codes from upstream).

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use session_client::{Dispatcher, Error as ClientError, RequestSpec};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, instrument, warn};

use crate::metrics;

/// Largest inbound body the proxy will buffer
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Dispatcher,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Holds one slot of the in-flight counter until dropped, so cancelled
/// requests are released too.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request upstream with the session credential attached.
///
/// The dispatcher performs at most one refresh-and-replay on a 401. Requests
/// that get no upstream response are never replayed here.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.in_flight);
    let started = Instant::now();

    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = forwardable_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                "proxy_error",
                &format!("invalid request body: {e}"),
                &request_id,
            );
            metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return response;
        }
    };

    let spec = RequestSpec::new(method.clone(), path_and_query)
        .headers(headers)
        .body(body);

    let response = match state.dispatcher.send(spec).await {
        Ok(upstream) => {
            let (status, upstream_headers, body) = upstream.into_parts();
            let mut response = Response::builder().status(status);
            for (name, value) in &upstream_headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "proxy_error",
                        &format!("response build error: {e}"),
                        &request_id,
                    )
                })
        }
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            let (status, error_type, kind) = classify_error(&e);
            metrics::record_upstream_error(kind);
            if e.is_session_terminated() {
                warn!(error = %e, "session terminated, re-authentication required");
            } else {
                error!(error = %e, "upstream request failed");
            }
            error_response(status, error_type, &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Map a dispatcher error to (status, error type, metric label).
fn classify_error(e: &ClientError) -> (StatusCode, &'static str, &'static str) {
    match e {
        ClientError::SessionTerminated(_) => (
            StatusCode::UNAUTHORIZED,
            "session_terminated",
            "session_terminated",
        ),
        ClientError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "proxy_error", "timeout"),
        ClientError::Request(_) => (StatusCode::BAD_REQUEST, "proxy_error", "request"),
        _ => (StatusCode::BAD_GATEWAY, "proxy_error", "connection"),
    }
}

/// Copy request headers that may travel upstream.
///
/// Drops hop-by-hop headers, `Host` (the upstream URL decides it) and the
/// caller's `Authorization`, which the dispatcher replaces with the session
/// token.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || *name == header::HOST || *name == header::AUTHORIZATION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
