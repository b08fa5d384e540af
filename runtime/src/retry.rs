//! Retry policies and the retry template that drives them.
//!
//! A [`RetryPolicyTemplate`] runs a unit of work, and on failure asks a fresh
//! [`RetryPolicy`] instance (one per sequence, created by a
//! [`RetryPolicyFactory`]) whether and when to try again. A
//! [`RetryNotifier`] observes every failure and the final success.
//!
//! # Example
//!
//! ```rust
//! use correlator_runtime::retry::{RetryPolicyTemplate, SimpleRetryPolicy};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let template = RetryPolicyTemplate::new(SimpleRetryPolicy::bounded(3, Duration::from_millis(1)));
//!
//! let result = template
//!     .retry("answer", |attempt| async move {
//!         if attempt < 2 {
//!             anyhow::bail!("attempt {attempt} failed");
//!         }
//!         Ok(42)
//!     })
//!     .await;
//!
//! assert_eq!(result.ok(), Some(42));
//! # });
//! ```

use crate::config::RetryConfig;
use crate::metrics::RetryMetrics;
use futures::future::BoxFuture;
use rand::Rng;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep};

/// Retry failures.
#[derive(Error, Debug)]
pub enum RetryError {
    /// The policy gave up; carries the last failure
    #[error("Retries exhausted for '{description}' after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Description of the work
        description: String,
        /// Attempts made
        attempts: u32,
        /// Failure of the final attempt
        last_error: anyhow::Error,
    },

    /// The executor running the sequence failed
    #[error("Retry executor failed: {0}")]
    Executor(String),
}

impl RetryError {
    /// Failure of the final attempt, if the policy gave up.
    #[must_use]
    pub const fn last_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Executor(_) => None,
        }
    }

    /// Consume the error, returning the last failure if there is one.
    #[must_use]
    pub fn into_last_error(self) -> Option<anyhow::Error> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Executor(_) => None,
        }
    }
}

/// State of one retry sequence.
#[derive(Debug, Clone)]
pub struct RetryContext {
    description: String,
    attempts: u32,
    last_failure: Option<String>,
    metadata: BTreeMap<String, String>,
    ok: bool,
    started: Instant,
}

impl RetryContext {
    /// Start a sequence for the work described by `description`.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            attempts: 0,
            last_failure: None,
            metadata: BTreeMap::new(),
            ok: false,
            started: Instant::now(),
        }
    }

    /// Description of the work.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Attempts made so far, including the running one.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Text of the most recent failure.
    #[must_use]
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// Metadata value for `key`.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Attach metadata visible to later attempts and the notifier.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Whether the work succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    /// Time since the sequence started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Decision of a policy after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStatus {
    /// Try again after `delay`
    Retry {
        /// Pause before the next attempt
        delay: Duration,
    },
    /// Give up
    Exhausted,
}

impl PolicyStatus {
    /// Whether the policy gave up.
    #[must_use]
    pub const fn is_exhausted(self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// One stateful retry sequence.
pub trait RetryPolicy: Send {
    /// Consume one failure and decide what happens next.
    fn apply_policy(&mut self, cause: &anyhow::Error) -> PolicyStatus;
}

/// Creates a fresh [`RetryPolicy`] per retry sequence.
pub trait RetryPolicyFactory: Send + Sync {
    /// New policy instance with reset counters.
    fn create_retry_instance(&self) -> Box<dyn RetryPolicy>;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn apply_policy(&mut self, _cause: &anyhow::Error) -> PolicyStatus {
        PolicyStatus::Exhausted
    }
}

impl RetryPolicyFactory for NoRetryPolicy {
    fn create_retry_instance(&self) -> Box<dyn RetryPolicy> {
        Box::new(Self)
    }
}

/// How many retries a [`SimpleRetryPolicy`] allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCount {
    /// At most this many retries after the first attempt
    Bounded(u32),
    /// Retry until the work succeeds
    Forever,
}

type Retryable = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Fixed-frequency retries, bounded by count and optionally elapsed time.
#[derive(Clone)]
pub struct SimpleRetryPolicy {
    count: RetryCount,
    frequency: Duration,
    max_elapsed: Option<Duration>,
    retryable: Option<Retryable>,
}

impl SimpleRetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(count: RetryCount, frequency: Duration) -> Self {
        Self {
            count,
            frequency,
            max_elapsed: None,
            retryable: None,
        }
    }

    /// Retry up to `retries` times.
    #[must_use]
    pub const fn bounded(retries: u32, frequency: Duration) -> Self {
        Self::new(RetryCount::Bounded(retries), frequency)
    }

    /// Retry until success.
    #[must_use]
    pub const fn forever(frequency: Duration) -> Self {
        Self::new(RetryCount::Forever, frequency)
    }

    /// Policy from the retry section of the runtime configuration.
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self::bounded(config.max_retries, config.frequency())
    }

    /// Give up once the sequence has run for `max_elapsed`.
    #[must_use]
    pub const fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Only retry failures for which `predicate` holds.
    #[must_use]
    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }
}

impl std::fmt::Debug for SimpleRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleRetryPolicy")
            .field("count", &self.count)
            .field("frequency", &self.frequency)
            .field("max_elapsed", &self.max_elapsed)
            .finish_non_exhaustive()
    }
}

struct SimpleRetryInstance {
    policy: SimpleRetryPolicy,
    retries: u32,
    started: Instant,
}

impl RetryPolicy for SimpleRetryInstance {
    fn apply_policy(&mut self, cause: &anyhow::Error) -> PolicyStatus {
        if let Some(retryable) = &self.policy.retryable {
            if !retryable(cause) {
                return PolicyStatus::Exhausted;
            }
        }
        if let Some(max_elapsed) = self.policy.max_elapsed {
            if self.started.elapsed() >= max_elapsed {
                return PolicyStatus::Exhausted;
            }
        }
        if let RetryCount::Bounded(max) = self.policy.count {
            if self.retries >= max {
                return PolicyStatus::Exhausted;
            }
        }
        self.retries += 1;
        PolicyStatus::Retry {
            delay: self.policy.frequency,
        }
    }
}

impl RetryPolicyFactory for SimpleRetryPolicy {
    fn create_retry_instance(&self) -> Box<dyn RetryPolicy> {
        Box::new(SimpleRetryInstance {
            policy: self.clone(),
            retries: 0,
            started: Instant::now(),
        })
    }
}

/// Backoff that grows geometrically between redeliveries of the same event.
///
/// Without overrides a failing event is retried three times, 100ms after the
/// first failure and twice as long after each further one, never waiting more
/// than 30 seconds. Jitter is off unless asked for.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    /// Retries granted before the policy reports [`PolicyStatus::Exhausted`]
    pub max_retries: u32,
    /// Pause after the first failure
    pub initial_delay: Duration,
    /// Ceiling for any single pause
    pub max_delay: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Scale each delay by a random factor in `0.5..=1.0`
    pub jitter: bool,
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExponentialBackoffPolicy {
    /// Start from the defaults described on the type.
    #[must_use]
    pub const fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Pause before retry number `attempt + 1`, before jitter.
    ///
    /// `initial_delay * multiplier^attempt`, clamped to `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(scaled as u64).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Builder for [`ExponentialBackoffPolicy`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoffBuilder {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoffBuilder {
    /// Retries before giving up.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Pause after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Longest single pause.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor per retry.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Randomize delays.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Finish the policy.
    #[must_use]
    pub const fn build(self) -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

struct BackoffInstance {
    policy: ExponentialBackoffPolicy,
    attempt: u32,
}

impl RetryPolicy for BackoffInstance {
    fn apply_policy(&mut self, _cause: &anyhow::Error) -> PolicyStatus {
        if self.attempt >= self.policy.max_retries {
            return PolicyStatus::Exhausted;
        }
        let delay = self
            .policy
            .jittered(self.policy.delay_for_attempt(self.attempt));
        self.attempt += 1;
        PolicyStatus::Retry { delay }
    }
}

impl RetryPolicyFactory for ExponentialBackoffPolicy {
    fn create_retry_instance(&self) -> Box<dyn RetryPolicy> {
        Box::new(BackoffInstance {
            policy: self.clone(),
            attempt: 0,
        })
    }
}

/// Observer of a retry sequence.
pub trait RetryNotifier: Send + Sync {
    /// An attempt failed.
    fn on_failure(&self, context: &RetryContext, cause: &anyhow::Error);

    /// The work succeeded; called once per sequence.
    fn on_success(&self, context: &RetryContext);
}

/// Notifier that logs and counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRetryNotifier;

impl RetryNotifier for LoggingRetryNotifier {
    fn on_failure(&self, context: &RetryContext, cause: &anyhow::Error) {
        RetryMetrics::record_attempt();
        tracing::warn!(
            work = context.description(),
            attempt = context.attempts(),
            error = %cause,
            "Attempt failed"
        );
    }

    fn on_success(&self, context: &RetryContext) {
        if context.attempts() > 1 {
            RetryMetrics::record_success();
            tracing::info!(
                work = context.description(),
                attempt = context.attempts(),
                "Operation succeeded after retry"
            );
        }
    }
}

/// Unit of work run by a [`RetryPolicyTemplate`].
pub trait RetryCallback: Send + Sync {
    /// Run one attempt.
    ///
    /// # Errors
    ///
    /// Any failure; the policy decides whether it is retried.
    fn do_work<'a>(&'a self, context: &'a mut RetryContext) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Human readable description used in logs.
    fn work_description(&self) -> String;
}

/// Runs work under a retry policy.
///
/// Stateless between calls: each execution creates its own policy instance.
#[derive(Clone)]
pub struct RetryPolicyTemplate {
    factory: Arc<dyn RetryPolicyFactory>,
    notifier: Arc<dyn RetryNotifier>,
    metadata: BTreeMap<String, String>,
}

impl RetryPolicyTemplate {
    /// Template over `factory` with the logging notifier.
    #[must_use]
    pub fn new(factory: impl RetryPolicyFactory + 'static) -> Self {
        Self::with_shared_factory(Arc::new(factory))
    }

    /// Template over a shared factory.
    #[must_use]
    pub fn with_shared_factory(factory: Arc<dyn RetryPolicyFactory>) -> Self {
        Self {
            factory,
            notifier: Arc::new(LoggingRetryNotifier),
            metadata: BTreeMap::new(),
        }
    }

    /// Template from the retry section of the runtime configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(SimpleRetryPolicy::from_config(config))
    }

    /// Replace the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn RetryNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Metadata copied into every [`RetryContext`].
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fresh policy instance.
    #[must_use]
    pub fn create_retry_instance(&self) -> Box<dyn RetryPolicy> {
        self.factory.create_retry_instance()
    }

    /// Run `callback` until it succeeds or the policy gives up.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Exhausted`] with the last failure.
    pub async fn execute(&self, callback: &dyn RetryCallback) -> Result<RetryContext, RetryError> {
        let mut context = self.context(callback.work_description());
        let mut policy = self.create_retry_instance();

        loop {
            context.attempts += 1;
            match callback.do_work(&mut context).await {
                Ok(()) => {
                    self.succeeded(&mut context);
                    return Ok(context);
                },
                Err(err) => self.failed(&mut context, policy.as_mut(), err).await?,
            }
        }
    }

    /// Run the whole sequence, backoff sleeps included, on `handle`.
    ///
    /// # Errors
    ///
    /// - [`RetryError::Exhausted`] when the policy gives up
    /// - [`RetryError::Executor`] if the spawned task panicked or was cancelled
    pub async fn execute_on(
        &self,
        callback: Arc<dyn RetryCallback>,
        handle: &Handle,
    ) -> Result<RetryContext, RetryError> {
        let template = self.clone();
        handle
            .spawn(async move { template.execute(callback.as_ref()).await })
            .await
            .map_err(|e| RetryError::Executor(e.to_string()))?
    }

    /// Retry an async closure; it receives the zero-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Exhausted`] with the last failure.
    pub async fn retry<T, F, Fut>(&self, description: &str, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut context = self.context(description);
        let mut policy = self.create_retry_instance();

        loop {
            let attempt = context.attempts;
            context.attempts += 1;
            match operation(attempt).await {
                Ok(value) => {
                    self.succeeded(&mut context);
                    return Ok(value);
                },
                Err(err) => self.failed(&mut context, policy.as_mut(), err).await?,
            }
        }
    }

    fn context(&self, description: impl Into<String>) -> RetryContext {
        let mut context = RetryContext::new(description);
        context.metadata.extend(self.metadata.clone());
        context
    }

    fn succeeded(&self, context: &mut RetryContext) {
        context.ok = true;
        self.notifier.on_success(context);
    }

    /// Record the failure and sleep when the policy retries.
    async fn failed(
        &self,
        context: &mut RetryContext,
        policy: &mut dyn RetryPolicy,
        err: anyhow::Error,
    ) -> Result<(), RetryError> {
        context.last_failure = Some(err.to_string());
        self.notifier.on_failure(context, &err);

        match policy.apply_policy(&err) {
            PolicyStatus::Retry { delay } => {
                tracing::debug!(
                    work = context.description(),
                    attempt = context.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Retrying"
                );
                sleep(delay).await;
                Ok(())
            },
            PolicyStatus::Exhausted => {
                RetryMetrics::record_exhausted();
                tracing::error!(
                    work = context.description(),
                    attempt = context.attempts(),
                    error = %err,
                    "Operation failed after max retries"
                );
                Err(RetryError::Exhausted {
                    description: context.description.clone(),
                    attempts: context.attempts,
                    last_error: err,
                })
            },
        }
    }
}

impl std::fmt::Debug for RetryPolicyTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyTemplate")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
