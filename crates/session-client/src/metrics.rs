//! Access layer metrics
//!
//! - `session_refresh_total` (counter): label `outcome` (`success`, `terminated`,
//!   `superseded`)
//! - `session_refresh_coalesced_total` (counter): callers served by another
//!   caller's refresh
//! - `session_requests_total` (counter): label `outcome` (`ok`, `retried`,
//!   `terminated`, `transport_error`)
//!
//! Without an installed recorder these calls are no-ops.

pub(crate) fn record_refresh(outcome: &'static str) {
    metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_coalesced() {
    metrics::counter!("session_refresh_coalesced_total").increment(1);
}

pub(crate) fn record_request(outcome: &'static str) {
    metrics::counter!("session_requests_total", "outcome" => outcome).increment(1);
}
