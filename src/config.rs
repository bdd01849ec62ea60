use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

/// Top-level configuration for the relay.
///
/// Every section has defaults, so a partial (or empty) JSON document is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub dedup: DedupConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub intake: IntakeConfig,
    /// Message template; see [`Payload::render`](crate::Payload::render).
    pub message_template: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dedup: DedupConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            intake: IntakeConfig::default(),
            message_template: "Welcome <@{subject_id}> to the server! 🎉".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup.retention_ms == 0 {
            return Err(ConfigError::Invalid("dedup.retention_ms must be > 0".into()));
        }
        if self.dedup.capacity == 0 {
            return Err(ConfigError::Invalid("dedup.capacity must be > 0".into()));
        }
        if self.rate_limit.default_budget == 0 {
            return Err(ConfigError::Invalid("rate_limit.default_budget must be > 0".into()));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_ms must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.retry.retry_base_ms == 0 {
            return Err(ConfigError::Invalid("retry.retry_base_ms must be > 0".into()));
        }
        if self.retry.retry_max_ms < self.retry.retry_base_ms {
            return Err(ConfigError::Invalid(
                "retry.retry_max_ms must be >= retry.retry_base_ms".into(),
            ));
        }
        if self.retry.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid("retry.attempt_timeout_ms must be > 0".into()));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit.failure_threshold and circuit.success_threshold must be > 0".into(),
            ));
        }
        if self.intake.worker_count == 0 || self.intake.queue_size == 0 {
            return Err(ConfigError::Invalid(
                "intake.worker_count and intake.queue_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Deduplication window and memory bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a processed (tenant, subject) key is remembered.
    pub retention_ms: u64,
    /// Maximum live records; oldest are evicted first beyond this.
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_ms: 10 * 60 * 1_000,
            capacity: 10_000,
        }
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Local budget assumed for a resource until the remote side reports its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_budget: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_budget: 5,
            window_ms: 5_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    /// Timeout for one outbound call, independent of backoff.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.retry_max_ms),
            jitter: self.jitter,
            max_attempts: self.max_attempts,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Trips after consecutive dispatches end in an outage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    /// How long an open circuit refuses dispatches before admitting trials.
    pub recovery_timeout_ms: u64,
    /// Trial successes needed to close again.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 3,
        }
    }
}

impl CircuitConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    /// How long shutdown waits for queued and in-flight events.
    pub shutdown_grace_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_size: 1_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl IntakeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
