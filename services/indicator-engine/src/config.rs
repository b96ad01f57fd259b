//! Engine configuration
//!
//! One JSON document with a section per component. Every field has a
//! default, so an empty file (or no file at all) yields a runnable engine.
//!
//! ```json
//! { "aggregator": { "base_timeframe": "1m" },
//!   "registry": { "heartbeat_ttl_secs": 30 },
//!   "server": { "addr": "0.0.0.0:8080" } }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::backpressure::OverflowPolicy;
use crate::candles::Timeframe;
use crate::scheduler::InFlightPolicy;

/// Path of the JSON config file.
pub const CONFIG_PATH_ENV: &str = "INDICATOR_ENGINE_CONFIG";
/// Listen address override.
pub const WS_ADDR_ENV: &str = "WS_ADDR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Granularity ticks are aggregated into; every other timeframe is derived.
    pub base_timeframe: Timeframe,
    /// Closed base bars retained per symbol for derivation.
    pub max_history: usize,
    /// Ticks buffered per symbol worker before `on_tick` waits.
    pub symbol_queue_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            base_timeframe: Timeframe::M1,
            max_history: 1440,
            symbol_queue_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_ttl_secs: u64,
    pub max_keys_per_session: usize,
    /// Expired session ids remembered so late heartbeats get `SessionNotFound`.
    pub tombstone_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: 30,
            max_keys_per_session: 64,
            tombstone_capacity: 10_000,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lease_ttl_ms: u64,
    /// How long a worker that lost the lease waits for the holder's value.
    pub contention_wait_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Concurrent compute tasks across all keys.
    pub worker_pool_size: usize,
    pub in_flight_policy: InFlightPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 5_000,
            contention_wait_ms: 500,
            fetch_timeout_ms: 2_000,
            worker_pool_size: 8,
            in_flight_policy: InFlightPolicy::Finish,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn contention_wait(&self) -> Duration {
        Duration::from_millis(self.contention_wait_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Floor for the timeframe-proportional TTL.
    pub min_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { min_ttl_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub send_timeout_ms: u64,
    /// Consecutive send failures before a session is degraded.
    pub failure_threshold: u32,
    /// Lagging sessions at which backpressure reason becomes `server_load`.
    pub server_load_threshold: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            overflow_policy: OverflowPolicy::DropOldest,
            send_timeout_ms: 1_000,
            failure_threshold: 3,
            server_load_threshold: 5,
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub aggregator: AggregatorConfig,
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub delivery: DeliveryConfig,
    pub sweeper: SweeperConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from the file named by `INDICATOR_ENGINE_CONFIG` (if set), apply
    /// environment overrides, and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(&path)?,
            Err(_) => Self::default(),
        };
        if let Ok(addr) = std::env::var(WS_ADDR_ENV) {
            config.server.addr = addr;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load_from_file(config_path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        info!(path = config_path, "Configuration loaded");
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.aggregator.max_history == 0 {
            errors.push("aggregator.max_history must be positive".to_string());
        }
        if self.aggregator.symbol_queue_capacity == 0 {
            errors.push("aggregator.symbol_queue_capacity must be positive".to_string());
        }
        if self.registry.heartbeat_ttl_secs == 0 {
            errors.push("registry.heartbeat_ttl_secs must be positive".to_string());
        }
        if self.registry.max_keys_per_session == 0 {
            errors.push("registry.max_keys_per_session must be positive".to_string());
        }
        if self.scheduler.worker_pool_size == 0 {
            errors.push("scheduler.worker_pool_size must be positive".to_string());
        }
        if self.scheduler.lease_ttl_ms <= self.scheduler.fetch_timeout_ms {
            errors.push("scheduler.lease_ttl_ms must exceed scheduler.fetch_timeout_ms".to_string());
        }
        if self.delivery.queue_capacity == 0 {
            errors.push("delivery.queue_capacity must be positive".to_string());
        }
        if self.delivery.failure_threshold == 0 {
            errors.push("delivery.failure_threshold must be positive".to_string());
        }
        if self.sweeper.interval_secs == 0 {
            errors.push("sweeper.interval_secs must be positive".to_string());
        }
        if self.server.addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("server.addr {} is not a socket address", self.server.addr));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregator.base_timeframe, Timeframe::M1);
        assert_eq!(config.scheduler.in_flight_policy, InFlightPolicy::Finish);
        assert_eq!(config.delivery.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "aggregator": { "base_timeframe": "5s" },
            "delivery": { "overflow_policy": "drop_newest", "queue_capacity": 8 },
            "scheduler": { "in_flight_policy": "discard" }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.aggregator.base_timeframe, Timeframe::S5);
        assert_eq!(config.aggregator.max_history, 1440);
        assert_eq!(config.delivery.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.delivery.queue_capacity, 8);
        assert_eq!(config.scheduler.in_flight_policy, InFlightPolicy::Discard);
        assert_eq!(config.registry.heartbeat_ttl_secs, 30);
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = EngineConfig::default();
        config.registry.max_keys_per_session = 0;
        config.server.addr = "not-an-addr".to_string();

        match config.validate() {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("max_keys_per_session"));
                assert!(msg.contains("not-an-addr"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_timeframe_is_parse_error() {
        let json = r#"{ "aggregator": { "base_timeframe": "7m" } }"#;
        assert!(serde_json::from_str::<EngineConfig>(json).is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = EngineConfig::load_from_file("/nonexistent/engine.json").unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:8080");
    }
}
