//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (CONSTELLATION_* prefix, `__` nesting)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [runtime]
//! max_workers = 8
//! starvation_timeout_ms = 5000
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! CONSTELLATION_RUNTIME__MAX_WORKERS=16
//! CONSTELLATION_LOGGING__FORMAT=json
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler and worker-pool tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on concurrently running module invocations
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Whole-run timeout in milliseconds (None = unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_timeout_ms: Option<u64>,

    /// Queued work older than this is scheduled ahead of higher
    /// priorities
    #[serde(default = "default_starvation_timeout")]
    pub starvation_timeout_ms: u64,

    /// How long cancellation waits for in-flight modules before
    /// abandoning them
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

/// Module result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend selector; "memory" is built in
    #[serde(default = "default_cache_backend")]
    pub default_backend: String,

    /// Advisory bound for in-memory entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_max_workers() -> usize {
    8
}
fn default_starvation_timeout() -> u64 {
    5_000
}
fn default_drain_timeout() -> u64 {
    2_000
}
fn default_cache_backend() -> String {
    "memory".to_string()
}
fn default_max_entries() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_workers: default_max_workers(),
            global_timeout_ms: None,
            starvation_timeout_ms: default_starvation_timeout(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            default_backend: default_cache_backend(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (CONSTELLATION_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("CONSTELLATION_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONSTELLATION_").split("__"))
            .extract()
    }
}

/// Install a global tracing subscriber per the logging config. Safe to
/// call once per process; later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runtime.max_workers, 8);
        assert_eq!(config.runtime.global_timeout_ms, None);
        assert_eq!(config.cache.default_backend, "memory");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[runtime]"));
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[logging]"));
    }
}
