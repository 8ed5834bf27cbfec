//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The session cookie is loaded from DASHBOARD_SESSION_COOKIE or
//! session_cookie_file, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding the dashboard session cookie
const SESSION_COOKIE_ENV: &str = "DASHBOARD_SESSION_COOKIE";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub relay: RelayConfig,
}

/// REST backend and session settings
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    /// Status the backend uses for an expired credential
    #[serde(default = "default_auth_failure_status")]
    pub auth_failure_status: u16,
    /// Where to keep the access credential. In memory when absent.
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    /// File holding the session cookie (alternative to the env var)
    #[serde(default)]
    pub session_cookie_file: Option<PathBuf>,
    #[serde(skip)]
    pub session_cookie: Option<Secret<String>>,
}

/// Local listener settings
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_path() -> String {
    session_auth::DEFAULT_REFRESH_PATH.to_string()
}

fn default_refresh_timeout() -> u64 {
    session_auth::DEFAULT_REFRESH_TIMEOUT.as_secs()
}

fn default_auth_failure_status() -> u16 {
    401
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Session cookie resolution order:
    /// 1. DASHBOARD_SESSION_COOKIE env var
    /// 2. session_cookie_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(cookie) = std::env::var(SESSION_COOKIE_ENV)
            .ok()
            .and_then(|raw| Secret::from_trimmed(&raw))
        {
            config.backend.session_cookie = Some(cookie);
        } else if let Some(ref cookie_file) = config.backend.session_cookie_file {
            let raw = std::fs::read_to_string(cookie_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read session_cookie_file {}: {e}",
                    cookie_file.display()
                ))
            })?;
            config.backend.session_cookie = Secret::from_trimmed(&raw);
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let backend = &self.backend;
        if !backend.base_url.starts_with("http://") && !backend.base_url.starts_with("https://") {
            return Err(common::Error::invalid(
                "backend.base_url",
                format!("must start with http:// or https://, got: {}", backend.base_url),
            ));
        }
        if backend.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "backend.timeout_secs",
                "must be greater than 0",
            ));
        }
        if backend.refresh_timeout_secs == 0 {
            return Err(common::Error::invalid(
                "backend.refresh_timeout_secs",
                "must be greater than 0",
            ));
        }
        if !backend.refresh_path.starts_with('/') {
            return Err(common::Error::invalid(
                "backend.refresh_path",
                format!("must start with '/', got: {}", backend.refresh_path),
            ));
        }
        if !(400..500).contains(&backend.auth_failure_status) {
            return Err(common::Error::invalid(
                "backend.auth_failure_status",
                format!("must be a 4xx status, got: {}", backend.auth_failure_status),
            ));
        }
        if self.relay.max_connections == 0 {
            return Err(common::Error::invalid(
                "relay.max_connections",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("dashboard-relay.toml")
    }
}

impl BackendConfig {
    /// Absolute URL of the refresh endpoint.
    pub fn refresh_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.refresh_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}
