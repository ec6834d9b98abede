//! Application configuration.
//!
//! Loaded from a TOML document, then overridden from the environment
//! (`.env` is honoured via `dotenvy`), defaulted, and validated. Any error here
//! is fatal at startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Default config location when `HERALD_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/herald/config.toml";

/// Default ledger TTL: 7 days.
const DEFAULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CLAIM_LEASE_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_MAX_CONCURRENCY: usize = 32;

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    #[serde(default)]
    pub redis: LedgerConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub fanout: FanoutConfig,
}

/// A named partition binding sources to the targets that receive their items.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    /// Poll interval in seconds.
    #[serde(default)]
    pub interval_secs: u64,
    /// Ledger TTL override for items from this source.
    pub ttl_secs: Option<u64>,
}

impl SourceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

/// A delivery endpoint.
///
/// `options` is free-form; the delivery adapter for `kind` decides which keys
/// it understands (`format`, `requests_per_second`, `ttl_secs`, `name`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl TargetConfig {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    /// Numeric option; integers are widened so `rps = 2` and `rps = 2.0` agree.
    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(|v| v.as_f64())
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Redis,
    /// In-process map; entries do not survive a restart.
    Memory,
}

/// Delivery ledger settings (the `[redis]` table).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// Full connection URL; takes precedence over address/password/db.
    pub url: Option<String>,
    pub address: String,
    pub password: Option<String>,
    pub db: i64,
    /// Default TTL for delivered entries, in seconds.
    pub ttl_secs: u64,
    /// TTL of an in-flight claim before delivery is confirmed.
    pub claim_lease_secs: u64,
    /// Housekeeping sweep period; 0 disables the sweeper.
    pub sweep_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Redis,
            url: None,
            address: "localhost:6379".to_string(),
            password: None,
            db: 0,
            ttl_secs: 0,
            claim_lease_secs: 0,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl LedgerConfig {
    /// Redis connection URL built from the discrete fields unless `url` is set.
    pub fn connection_url(&self) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}/{}", password, self.address, self.db),
            None => format!("redis://{}/{}", self.address, self.db),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Maximum concurrent deliveries per fan-out call; 0 means unbounded.
    pub max_concurrency: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl AppConfig {
    /// Load from the path in `HERALD_CONFIG`, falling back to [`DEFAULT_CONFIG_PATH`].
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let path = std::env::var("HERALD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(path)
    }

    /// Read, override, default and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.apply_defaults();
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            groups = config.groups.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse a TOML document without overrides, defaults or validation.
    pub fn parse(content: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(content)?)
    }

    /// Override ledger and server settings from environment-style lookups.
    ///
    /// Unparseable numeric values are ignored rather than rejected.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            self.redis.url = Some(url);
        }
        if let Some(address) = lookup("REDIS_ADDRESS").filter(|v| !v.is_empty()) {
            self.redis.address = address;
        }
        if let Some(password) = lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()) {
            self.redis.password = Some(password);
        }
        if let Some(db) = lookup("REDIS_DB").and_then(|v| v.parse().ok()) {
            self.redis.db = db;
        }
        if let Some(ttl) = lookup("REDIS_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.redis.ttl_secs = ttl;
        }
        if let Some(port) = lookup("HERALD_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Fill zero-valued settings with their defaults.
    pub fn apply_defaults(&mut self) {
        if self.server.port == 0 {
            self.server.port = DEFAULT_PORT;
        }
        if self.redis.ttl_secs == 0 {
            self.redis.ttl_secs = DEFAULT_TTL_SECS;
        }
        if self.redis.claim_lease_secs == 0 {
            self.redis.claim_lease_secs = DEFAULT_CLAIM_LEASE_SECS;
        }
    }

    /// Structural validation of groups, sources and targets.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.groups.is_empty() {
            return Err(AppError::config("no groups configured"));
        }

        for group in &self.groups {
            if group.name.is_empty() {
                return Err(AppError::config("group name cannot be empty"));
            }
            if group.sources.is_empty() {
                return Err(AppError::config(format!("group {} has no sources", group.name)));
            }
            if group.targets.is_empty() {
                return Err(AppError::config(format!("group {} has no targets", group.name)));
            }

            for source in &group.sources {
                if source.kind.is_empty() {
                    return Err(AppError::config(format!(
                        "source type cannot be empty in group {}",
                        group.name
                    )));
                }
                if source.url.is_empty() {
                    return Err(AppError::config(format!(
                        "source URL cannot be empty in group {}",
                        group.name
                    )));
                }
                if source.interval_secs == 0 {
                    return Err(AppError::config(format!(
                        "source interval cannot be zero in group {}",
                        group.name
                    )));
                }
            }

            for target in &group.targets {
                if target.kind.is_empty() {
                    return Err(AppError::config(format!(
                        "target type cannot be empty in group {}",
                        group.name
                    )));
                }
                if target.value.is_empty() {
                    return Err(AppError::config(format!(
                        "target value cannot be empty in group {}",
                        group.name
                    )));
                }
            }
        }

        Ok(())
    }
}
