//! Service configuration
//!
//! Configuration is read from YAML and then selectively overridden from the
//! environment, so deployments can keep one file and tweak a few knobs per host.
//!
//! ```yaml
//! bus:
//!   queue_capacity: 16
//! adapter:
//!   read_timeout_ms: 5000
//!   open_timeout_ms: 10000
//!   reconnect:
//!     max_attempts: 5
//!     initial_backoff_ms: 100
//!     max_backoff_ms: 5000
//!     max_elapsed_ms: 30000
//! session:
//!   cleanup_timeout_ms: 2000
//!   default_rate: 10
//! logging:
//!   level: info
//!   format: pretty
//! sources:
//!   - id: cam1
//!     name: Front door
//!     type: test_pattern
//!     frameRate: 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{SourceConfig, UpdateRate};
use crate::{Result, StreamError};

/// Environment variable overriding `logging.level`
pub const ENV_LOG_LEVEL: &str = "FRAMECAST_LOG_LEVEL";
/// Environment variable overriding `bus.queue_capacity`
pub const ENV_QUEUE_CAPACITY: &str = "FRAMECAST_QUEUE_CAPACITY";
/// Environment variable overriding `session.cleanup_timeout_ms`
pub const ENV_CLEANUP_TIMEOUT_MS: &str = "FRAMECAST_CLEANUP_TIMEOUT_MS";

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub adapter: AdapterConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    /// Sources seeded into the in-memory registry
    pub sources: Vec<SourceConfig>,
}

/// Frame bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Frames buffered per subscriber before the oldest are dropped
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

impl BusConfig {
    /// Set the per-subscriber queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Frame source adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Longest wait for a single frame before the read counts as a disconnect
    #[serde(rename = "read_timeout_ms", with = "duration_ms")]
    pub read_timeout: Duration,

    /// Longest wait for a single connection attempt
    #[serde(rename = "open_timeout_ms", with = "duration_ms")]
    pub open_timeout: Duration,

    /// Reconnection policy for transient failures
    pub reconnect: ReconnectPolicy,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            open_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl AdapterConfig {
    /// Set the per-read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the per-connect timeout
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the reconnection policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Bounded exponential backoff for reconnecting to a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnection attempts before the source is declared unavailable
    pub max_attempts: u32,

    /// Delay before the first attempt
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,

    /// Upper bound for a single delay
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,

    /// Total time budget for one reconnection episode
    #[serde(rename = "max_elapsed_ms", with = "duration_ms")]
    pub max_elapsed: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Set the maximum number of attempts
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the first delay
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Set the delay cap
    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Set the total time budget
    pub fn max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = budget;
        self
    }

    /// Delay before the given attempt (1-based): 100ms, 200ms, 400ms, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exponent).min(self.max_backoff)
    }
}

/// Session manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on how long tearing down a session may take
    #[serde(rename = "cleanup_timeout_ms", with = "duration_ms")]
    pub cleanup_timeout: Duration,

    /// Frames per second used when a start command carries no rate
    pub default_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { cleanup_timeout: Duration::from_secs(2), default_rate: 10 }
    }
}

impl SessionConfig {
    /// Set the cleanup bound
    pub fn cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Rate applied to start commands without an explicit rate
    pub fn default_update_rate(&self) -> UpdateRate {
        UpdateRate::Max(self.default_rate)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `framecast=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

impl Config {
    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| StreamError::io(path, e))?;
        let mut config = Self::from_yaml_str(&yaml)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }

        if let Some(capacity) = lookup(ENV_QUEUE_CAPACITY) {
            self.bus.queue_capacity = capacity.trim().parse().map_err(|_| {
                let reason = format!("{ENV_QUEUE_CAPACITY} must be an integer, got '{capacity}'");
                StreamError::config(reason)
            })?;
        }

        if let Some(timeout) = lookup(ENV_CLEANUP_TIMEOUT_MS) {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                let name = ENV_CLEANUP_TIMEOUT_MS;
                StreamError::config(format!("{name} must be an integer, got '{timeout}'"))
            })?;
            self.session.cleanup_timeout = Duration::from_millis(millis);
        }

        self.validate()
    }

    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.bus.queue_capacity == 0 {
            return Err(StreamError::config("bus.queue_capacity must be at least 1"));
        }
        if self.adapter.reconnect.max_attempts == 0 {
            return Err(StreamError::config("adapter.reconnect.max_attempts must be at least 1"));
        }
        if self.session.default_rate == 0 {
            return Err(StreamError::config("session.default_rate must be at least 1"));
        }
        for source in &self.sources {
            source.validate()?;
        }
        Ok(())
    }
}
