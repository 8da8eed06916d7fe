//! Prometheus metrics exposition
//!
//! Proxy-level metrics recorded here:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `session_events_total` (counter): label `event`
//! - `session_authenticated` (gauge): 1 while a credential is held
//!
//! The `session_*` counters emitted by the access layer itself land in the
//! same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram with `_bucket` lines rather than the default summary. Buckets
/// span 5ms to 60s, covering the configurable upstream timeout.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}

/// Record a session lifecycle event observed by the proxy.
pub fn record_session_event(event: &'static str) {
    metrics::counter!("session_events_total", "event" => event).increment(1);
}

/// Track whether the proxy currently holds a credential.
pub fn set_session_authenticated(authenticated: bool) {
    metrics::gauge!("session_authenticated").set(if authenticated { 1.0 } else { 0.0 });
}
