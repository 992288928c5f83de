//! Engine configuration
//!
//! Limits, time budgets and the default retry policy. Loaded from TOML or
//! built in code with the `with_*` methods.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Retry policy for transient repository failures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[inline]
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// With max attempts
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// With initial backoff
    #[inline]
    #[must_use]
    pub fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Delay to wait after `attempt` (1-based) failed
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.max_backoff_ms as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` on zero attempts or a shrinking multiplier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "retry.multiplier",
                reason: format!("must be >= 1.0, got {}", self.multiplier),
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry.initial_backoff_ms",
                reason: "must not exceed max_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum requested target IDs per submission
    pub max_targets: usize,
    /// Maximum target IDs after descendant expansion
    pub max_expanded_targets: usize,
    /// Preflight time budget in milliseconds
    pub preflight_timeout_ms: u64,
    /// Concurrent preflight checks
    pub preflight_concurrency: usize,
    /// Overall executor time budget in milliseconds
    pub execution_timeout_ms: u64,
    /// Parallel group size for non-atomic deletes
    pub max_parallel: usize,
    /// Outcomes returned with progress snapshots
    pub recent_outcomes: usize,
    /// How long a succeeded batch still answers a repeated client request ID
    pub idempotency_window_secs: u64,
    /// Budget for one event publication; a slower bus loses the event
    pub event_timeout_ms: u64,
    /// Default retry policy
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_targets: 1000,
            max_expanded_targets: 10_000,
            preflight_timeout_ms: 5_000,
            preflight_concurrency: 16,
            execution_timeout_ms: 300_000,
            max_parallel: 8,
            recent_outcomes: 10,
            idempotency_window_secs: 600,
            event_timeout_ms: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns `ConfigError` on malformed TOML or out-of-range values.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 8] = [
            ("max_targets", self.max_targets as u64),
            ("max_expanded_targets", self.max_expanded_targets as u64),
            ("preflight_timeout_ms", self.preflight_timeout_ms),
            ("preflight_concurrency", self.preflight_concurrency as u64),
            ("execution_timeout_ms", self.execution_timeout_ms),
            ("max_parallel", self.max_parallel as u64),
            ("recent_outcomes", self.recent_outcomes as u64),
            ("event_timeout_ms", self.event_timeout_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.max_expanded_targets < self.max_targets {
            return Err(ConfigError::Invalid {
                field: "max_expanded_targets",
                reason: "must be >= max_targets".to_string(),
            });
        }
        self.retry.validate()
    }

    /// With preflight timeout
    #[inline]
    #[must_use]
    pub fn with_preflight_timeout(mut self, timeout: Duration) -> Self {
        self.preflight_timeout_ms = duration_ms(timeout);
        self
    }

    /// With execution timeout
    #[inline]
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = duration_ms(timeout);
        self
    }

    /// With max requested targets
    #[inline]
    #[must_use]
    pub fn with_max_targets(mut self, max: usize) -> Self {
        self.max_targets = max;
        self
    }

    /// With max expanded targets
    #[inline]
    #[must_use]
    pub fn with_max_expanded_targets(mut self, max: usize) -> Self {
        self.max_expanded_targets = max;
        self
    }

    /// With parallel group size
    #[inline]
    #[must_use]
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    /// With default retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With idempotency window
    #[inline]
    #[must_use]
    pub fn with_idempotency_window(mut self, window: Duration) -> Self {
        self.idempotency_window_secs = window.as_secs();
        self
    }

    /// With event publication budget
    #[inline]
    #[must_use]
    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout_ms = duration_ms(timeout);
        self
    }

    /// Preflight budget
    #[inline]
    #[must_use]
    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_millis(self.preflight_timeout_ms)
    }

    /// Executor budget
    #[inline]
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Event publication budget
    #[inline]
    #[must_use]
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// Idempotency window
    #[inline]
    #[must_use]
    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
