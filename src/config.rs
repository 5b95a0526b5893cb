//! Configuration management for Tollgate.
//!
//! Settings are read from an optional YAML file and then overridden by
//! `TOLLGATE__<SECTION>__<KEY>` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ratelimit::{KeyBuilder, RuleConfig, RuleSet};

const ENV_PREFIX: &str = "TOLLGATE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`
    ///
    /// Only enable behind a reverse proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_proxy: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Rules declared inline
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Path to a rules file (directive syntax, or YAML by extension)
    pub rules_path: Option<PathBuf>,

    /// Idle time after which a bucket is dropped; derived from the rules
    /// when unset
    pub retention_secs: Option<u64>,

    /// How often idle buckets are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How often `rules_path` is re-read, 0 disables reloading
    #[serde(default)]
    pub reload_interval_secs: u64,

    /// Prefix length IPv4 clients are grouped by
    #[serde(default = "default_ipv4_prefix")]
    pub ipv4_prefix: u8,

    /// Prefix length IPv6 clients are grouped by
    #[serde(default = "default_ipv6_prefix")]
    pub ipv6_prefix: u8,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            rules_path: None,
            retention_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            reload_interval_secs: 0,
            ipv4_prefix: default_ipv4_prefix(),
            ipv6_prefix: default_ipv6_prefix(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_ipv4_prefix() -> u8 {
    32
}

fn default_ipv6_prefix() -> u8 {
    128
}

impl RateLimitingConfig {
    /// Validate the inline rules followed by the rules file, if any.
    pub fn load_rules(&self) -> Result<RuleSet> {
        let mut rules = RuleSet::from_configs(self.rules.clone())?.rules().to_vec();
        if let Some(path) = &self.rules_path {
            rules.extend(RuleSet::from_file(path)?.rules().iter().cloned());
        }
        Ok(RuleSet::new(rules))
    }

    pub fn key_builder(&self) -> Result<KeyBuilder> {
        KeyBuilder::new(self.ipv4_prefix, self.ipv6_prefix)
    }

    /// Retention pinned by `retention_secs`, if any.
    pub fn fixed_retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    pub fn retention(&self, rules: &RuleSet) -> Duration {
        self.fixed_retention()
            .unwrap_or_else(|| rules.default_retention())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        match self.reload_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional file layered with the
    /// environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::new(path, FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
