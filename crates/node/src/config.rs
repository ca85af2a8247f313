//! Node configuration loaded from environment variables.

use std::time::Duration;

use saga::{MAX_STEP_TIMEOUT, SagaSettings};

/// Log output format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Node configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: ops HTTP bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL URL; in-memory stores when unset
/// - `BUS_PARTITIONS` (8), `WORKERS_PER_TOPIC` (4)
/// - `STEP_TIMEOUT_SECS` (30), `MAX_REISSUES` (3), `SWEEP_INTERVAL_SECS` (5)
/// - `CACHE_TTL_SECS` (86400)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub bus_partitions: u32,
    pub workers_per_topic: usize,
    pub step_timeout: Duration,
    pub max_reissues: u32,
    pub sweep_interval: Duration,
    pub cache_ttl: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let secs = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_secs).unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|f| LogFormat::parse(&f))
                .unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            bus_partitions: parsed("BUS_PARTITIONS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.bus_partitions),
            workers_per_topic: parsed("WORKERS_PER_TOPIC")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.workers_per_topic),
            step_timeout: parsed("STEP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .filter(|t| *t <= MAX_STEP_TIMEOUT)
                .unwrap_or(defaults.step_timeout),
            max_reissues: parsed("MAX_REISSUES")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_reissues),
            sweep_interval: parsed("SWEEP_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            cache_ttl: secs("CACHE_TTL_SECS", defaults.cache_ttl),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn saga_settings(&self) -> SagaSettings {
        SagaSettings {
            step_timeout: self.step_timeout,
            max_reissues: self.max_reissues,
            sweep_interval: self.sweep_interval,
            cache_ttl: self.cache_ttl,
            workers_per_topic: self.workers_per_topic,
            ..SagaSettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let saga = SagaSettings::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            bus_partitions: 8,
            workers_per_topic: saga.workers_per_topic,
            step_timeout: saga.step_timeout,
            max_reissues: saga.max_reissues,
            sweep_interval: saga.sweep_interval,
            cache_ttl: saga.cache_ttl,
        }
    }
}
