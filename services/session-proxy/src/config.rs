//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens never live in the TOML; they are installed through the admin API
//! and persisted in the credentials file.

use serde::Deserialize;
use session_client::ClientConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var that overrides `session.credentials_path`
pub const CREDENTIALS_PATH_ENV: &str = "SESSION_CREDENTIALS_PATH";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session persistence and refresh settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub credentials_path: PathBuf,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

/// Admin listener. The admin API is disabled when this section is absent.
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_refresh_path() -> String {
    session_auth::DEFAULT_REFRESH_PATH.to_string()
}

fn default_refresh_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Validate upstream_url is a valid URL with http(s) scheme
        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.session.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        if config.session.refresh_path.trim().is_empty() {
            return Err(common::Error::Config("refresh_path must not be empty".into()));
        }

        if let Ok(p) = std::env::var(CREDENTIALS_PATH_ENV)
            && !p.is_empty()
        {
            config.session.credentials_path = PathBuf::from(p);
        }

        if let Some(admin) = &config.admin
            && admin.listen_addr == config.proxy.listen_addr
        {
            return Err(common::Error::Config(format!(
                "admin listen_addr must differ from proxy listen_addr ({})",
                admin.listen_addr
            )));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-proxy.toml")
    }

    /// Access layer settings derived from the proxy and session sections.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.proxy.upstream_url.clone(),
            request_timeout: Duration::from_secs(self.proxy.timeout_secs),
            refresh_path: self.session.refresh_path.clone(),
            refresh_timeout: Duration::from_secs(self.session.refresh_timeout_secs),
        }
    }
}
