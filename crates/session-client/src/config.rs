//! Access layer configuration

use std::time::Duration;

use session_auth::DEFAULT_REFRESH_PATH;

/// Default deadline for one outbound request, including the body read
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for one refresh exchange
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Where requests go and how long each step may take.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL; relative request paths are joined onto it
    pub base_url: String,
    pub request_timeout: Duration,
    /// Refresh endpoint, relative to `base_url` unless absolute
    pub refresh_path: String,
    pub refresh_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    /// Resolve a request path against the base URL.
    ///
    /// Absolute `http(s)://` URLs are used as given.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Absolute URL of the refresh endpoint.
    pub fn refresh_url(&self) -> String {
        self.url_for(&self.refresh_path)
    }
}
