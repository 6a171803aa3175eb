//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret is loaded from OAUTH_CLIENT_SECRET or
//! client_secret_file, never stored in the TOML directly.

use account_pool::RotationMode;
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// Where the pool and profile documents live and how a new pool behaves
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub path: PathBuf,
    pub profiles_path: PathBuf,
    #[serde(default)]
    pub default_mode: RotationMode,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

/// Auth store and token endpoint settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub store_path: PathBuf,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

/// Admin HTTP listener
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Proactive background refresh
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub threshold_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval(),
            threshold_secs: default_refresh_threshold(),
        }
    }
}

fn default_refresh_margin() -> u64 {
    oauth_auth::DEFAULT_REFRESH_MARGIN_MS / 1000
}

fn default_provider() -> String {
    oauth_auth::DEFAULT_PROVIDER.to_string()
}

fn default_token_endpoint() -> String {
    oauth_auth::DEFAULT_TOKEN_ENDPOINT.to_string()
}

fn default_client_id() -> String {
    oauth_auth::DEFAULT_CLIENT_ID.to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    900
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.auth.token_endpoint.starts_with("http://")
            && !config.auth.token_endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "token_endpoint must start with http:// or https://, got: {}",
                config.auth.token_endpoint
            )));
        }

        if config.auth.provider.trim().is_empty() {
            return Err(common::Error::Config("provider must not be empty".into()));
        }

        if config.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.refresh.interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh interval_secs must be greater than 0".into(),
            ));
        }

        if let Ok(secret) = std::env::var("OAUTH_CLIENT_SECRET") {
            config.auth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.auth.client_secret_file {
            let secret = Secret::from_file(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            config.auth.client_secret = Some(secret);
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
        PathBuf::from("account-pool.toml")
    }

    pub fn refresh_margin_ms(&self) -> u64 {
        self.pool.refresh_margin_secs.saturating_mul(1000)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.interval_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh.threshold_secs)
    }
}
