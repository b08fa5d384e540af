//! Runtime configuration.
//!
//! [`RuntimeConfig`] groups the settings of every component. It deserializes
//! with serde (missing fields fall back to defaults), can be overlaid from
//! `CORRELATOR_*` environment variables and is checked with
//! [`RuntimeConfig::validate`] before a [`RuntimeContext`] starts.
//!
//! # Example
//!
//! ```
//! use correlator_runtime::config::{RequesterConfig, RuntimeConfig};
//!
//! let config = RuntimeConfig::default()
//!     .with_requester(RequesterConfig::default().with_timeout_ms(250).with_fail_on_timeout(false));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.requester.timeout_ms, 250);
//! ```
//!
//! [`RuntimeContext`]: crate::context::RuntimeContext

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default time a requester waits for its reply.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: i64 = 10_000;

/// Default capacity of the processed-group memory of an event correlator.
pub const MAX_PROCESSED_GROUPS: usize = 50_000;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it is rejected
        reason: String,
    },

    /// An environment variable could not be parsed
    #[error("Environment variable {var} has unparseable value '{value}'")]
    Env {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
}

/// What a waiting requester returns when its wait is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancellationMode {
    /// Fail with `MessagingError::Cancelled`
    #[default]
    Error,
    /// Return no result, as older runtimes did on interruption
    ReturnNone,
}

/// Settings of an `AsyncRequestReplyRequester`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequesterConfig {
    /// Reply timeout in milliseconds; zero or negative waits forever
    pub timeout_ms: i64,
    /// Fail with a timeout error (true) or return the partial aggregate (false)
    pub fail_on_timeout: bool,
    /// Behaviour when the wait is cancelled
    pub cancellation: CancellationMode,
}

impl RequesterConfig {
    /// Set the reply timeout.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the timeout behaviour.
    #[must_use]
    pub const fn with_fail_on_timeout(mut self, fail_on_timeout: bool) -> Self {
        self.fail_on_timeout = fail_on_timeout;
        self
    }

    /// Set the cancellation behaviour.
    #[must_use]
    pub const fn with_cancellation(mut self, cancellation: CancellationMode) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// The bounded wait, or `None` to wait forever.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms > 0 {
            Some(Duration::from_millis(self.timeout_ms as u64))
        } else {
            None
        }
    }
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            fail_on_timeout: true,
            cancellation: CancellationMode::Error,
        }
    }
}

/// Settings of an `EventCorrelator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Age after which an incomplete group expires; zero disables expiry
    pub timeout_ms: u64,
    /// Expired groups are reported as failures (true) or aggregated partially
    pub fail_on_timeout: bool,
    /// Sweep interval of the timeout monitor
    pub monitor_interval_ms: u64,
    /// How many processed group ids are remembered to drop late events
    pub max_processed_groups: usize,
}

impl CorrelatorConfig {
    /// Group expiry, `None` when disabled.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms > 0 {
            Some(Duration::from_millis(self.timeout_ms))
        } else {
            None
        }
    }

    /// Sweep interval of the timeout monitor.
    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Set the group expiry.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the expiry behaviour.
    #[must_use]
    pub const fn with_fail_on_timeout(mut self, fail_on_timeout: bool) -> Self {
        self.fail_on_timeout = fail_on_timeout;
        self
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            fail_on_timeout: true,
            monitor_interval_ms: 100,
            max_processed_groups: MAX_PROCESSED_GROUPS,
        }
    }
}

/// Default settings of queues created by a `QueueManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueConfiguration {
    /// Maximum number of visible items; `None` is unbounded
    pub capacity: Option<usize>,
    /// Persist items through the manager's persistence strategy
    pub persistent: bool,
}

impl QueueConfiguration {
    /// An unbounded, transient queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capacity: None,
            persistent: false,
        }
    }

    /// Bound the queue.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Make the queue persistent.
    #[must_use]
    pub const fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Settings of the default retry template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Pause between attempts in milliseconds
    pub frequency_ms: u64,
}

impl RetryConfig {
    /// Pause between attempts.
    #[must_use]
    pub const fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            frequency_ms: 2_000,
        }
    }
}

/// Worker pool shape of a SEDA service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingProfile {
    /// Worker tasks per service
    pub max_workers: usize,
    /// Capacity of the service's queue; `None` is unbounded
    pub max_buffer_size: Option<usize>,
    /// How long an idle worker waits for an item before re-checking shutdown
    pub poll_interval_ms: u64,
    /// Redeliveries of a failing item before it goes to the dead letter queue
    pub max_redelivery: u32,
}

impl ThreadingProfile {
    /// Set the worker count.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Bound the service queue.
    #[must_use]
    pub const fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = Some(size);
        self
    }

    /// Set the redelivery limit.
    #[must_use]
    pub const fn with_max_redelivery(mut self, max_redelivery: u32) -> Self {
        self.max_redelivery = max_redelivery;
        self
    }

    /// Idle poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ThreadingProfile {
    fn default() -> Self {
        Self {
            max_workers: 16,
            max_buffer_size: None,
            poll_interval_ms: 50,
            max_redelivery: 3,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Requester settings
    pub requester: RequesterConfig,
    /// Event correlator settings
    pub correlator: CorrelatorConfig,
    /// Default queue settings
    pub queue: QueueConfiguration,
    /// Default retry settings
    pub retry: RetryConfig,
    /// SEDA worker settings
    pub threading: ThreadingProfile,
    /// Dead letter queue capacity
    pub dlq_max_size: usize,
    /// Refuse to start with an invalid configuration instead of falling back
    pub fails_deployment: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            requester: RequesterConfig::default(),
            correlator: CorrelatorConfig::default(),
            queue: QueueConfiguration::default(),
            retry: RetryConfig::default(),
            threading: ThreadingProfile::default(),
            dlq_max_size: 1000,
            fails_deployment: true,
        }
    }
}

impl RuntimeConfig {
    /// Replace the requester settings.
    #[must_use]
    pub const fn with_requester(mut self, requester: RequesterConfig) -> Self {
        self.requester = requester;
        self
    }

    /// Replace the correlator settings.
    #[must_use]
    pub const fn with_correlator(mut self, correlator: CorrelatorConfig) -> Self {
        self.correlator = correlator;
        self
    }

    /// Replace the default queue settings.
    #[must_use]
    pub const fn with_queue(mut self, queue: QueueConfiguration) -> Self {
        self.queue = queue;
        self
    }

    /// Replace the retry settings.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the threading profile.
    #[must_use]
    pub const fn with_threading(mut self, threading: ThreadingProfile) -> Self {
        self.threading = threading;
        self
    }

    /// Set the deployment failure policy.
    #[must_use]
    pub const fn with_fails_deployment(mut self, fails_deployment: bool) -> Self {
        self.fails_deployment = fails_deployment;
        self
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.correlator.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "correlator.monitor_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.correlator.max_processed_groups == 0 {
            return Err(ConfigError::Invalid {
                field: "correlator.max_processed_groups",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.queue.capacity == Some(0) {
            return Err(ConfigError::Invalid {
                field: "queue.capacity",
                reason: "a bounded queue needs room for at least one item".to_string(),
            });
        }
        if self.threading.max_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "threading.max_workers",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.threading.max_buffer_size == Some(0) {
            return Err(ConfigError::Invalid {
                field: "threading.max_buffer_size",
                reason: "a bounded buffer needs room for at least one item".to_string(),
            });
        }
        if self.threading.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "threading.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dlq_max_size == 0 {
            return Err(ConfigError::Invalid {
                field: "dlq_max_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Defaults overlaid with `CORRELATOR_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when a variable is set but unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|var| std::env::var(var).ok())
    }

    /// Overlay values looked up through `lookup` (a variable name to value
    /// function) onto this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when a value is present but unparseable.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(v) = parse_var(&lookup, "CORRELATOR_TIMEOUT_MS")? {
            self.requester.timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "CORRELATOR_FAIL_ON_TIMEOUT")? {
            self.requester.fail_on_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "CORRELATOR_FAILS_DEPLOYMENT")? {
            self.fails_deployment = v;
        }
        if let Some(v) = parse_var(&lookup, "CORRELATOR_QUEUE_CAPACITY")? {
            self.queue.capacity = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "CORRELATOR_RETRY_MAX")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "CORRELATOR_RETRY_FREQUENCY_MS")? {
            self.retry.frequency_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "CORRELATOR_WORKERS")? {
            self.threading.max_workers = v;
        }
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}
