//! Explicit runtime context.
//!
//! Every component receives a [`RuntimeContext`] at construction instead of
//! reaching for process-wide state. The context owns the correlation
//! registry, the event group registry, the tokio handle work is scheduled on,
//! the shared configuration and the shutdown signal.

use crate::config::{ConfigError, RuntimeConfig};
use crate::correlation::CorrelationRegistry;
use crate::correlator::GroupRegistry;
use crate::health::{HealthCheck, HealthStatus};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Context construction errors.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The configuration did not validate and `fails_deployment` is set
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// No tokio runtime is available to schedule work on
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Shared state of one runtime instance.
#[derive(Debug)]
pub struct RuntimeContext {
    config: Arc<RuntimeConfig>,
    correlations: Arc<CorrelationRegistry>,
    groups: Arc<GroupRegistry>,
    handle: Handle,
    shutdown: watch::Sender<bool>,
}

impl RuntimeContext {
    /// Validate `config` and build a context on the current tokio runtime.
    ///
    /// An invalid configuration fails the start when `fails_deployment` is
    /// set; otherwise the problem is logged and defaults are used.
    ///
    /// # Errors
    ///
    /// - [`ContextError::Config`] for an invalid configuration with
    ///   `fails_deployment`
    /// - [`ContextError::NoRuntime`] outside a tokio runtime
    pub fn start(config: RuntimeConfig) -> Result<Arc<Self>, ContextError> {
        let handle = Handle::try_current().map_err(|e| ContextError::NoRuntime(e.to_string()))?;
        Self::start_on(config, handle)
    }

    /// Like [`start`](Self::start), scheduling work on `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Config`] for an invalid configuration with
    /// `fails_deployment`.
    pub fn start_on(config: RuntimeConfig, handle: Handle) -> Result<Arc<Self>, ContextError> {
        let config = match config.validate() {
            Ok(()) => config,
            Err(err) if config.fails_deployment => {
                tracing::error!(error = %err, "Refusing to start with invalid configuration");
                return Err(err.into());
            },
            Err(err) => {
                tracing::warn!(error = %err, "Invalid configuration, falling back to defaults");
                RuntimeConfig::default().with_fails_deployment(false)
            },
        };

        let (shutdown, _) = watch::channel(false);
        let groups = Arc::new(GroupRegistry::new(config.correlator.max_processed_groups));
        tracing::info!(
            timeout_ms = config.requester.timeout_ms,
            workers = config.threading.max_workers,
            "Runtime context started"
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            correlations: Arc::new(CorrelationRegistry::new()),
            groups,
            handle,
            shutdown,
        }))
    }

    /// Shared configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Registry of requests waiting for a reply.
    #[must_use]
    pub const fn correlations(&self) -> &Arc<CorrelationRegistry> {
        &self.correlations
    }

    /// Registry of open event groups.
    #[must_use]
    pub const fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// Runtime handle background work is spawned on.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Receiver that flips to `true` on shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Signal shutdown and cancel every waiting request.
    ///
    /// Returns the number of requests released.
    pub fn shutdown(&self) -> usize {
        self.shutdown.send_replace(true);
        let cancelled = self.correlations.cancel_all();
        tracing::info!(cancelled, "Runtime context shut down");
        cancelled
    }

    /// Health of the shared registries.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let status = if self.is_shutdown() {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        HealthCheck::new("context", status)
            .with_metadata("pending_requests", self.correlations.len())
            .with_metadata("open_groups", self.groups.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ThreadingProfile;

    fn invalid() -> RuntimeConfig {
        RuntimeConfig::default().with_threading(ThreadingProfile::default().with_max_workers(0))
    }

    #[tokio::test]
    async fn test_invalid_config_fails_deployment() {
        let result = RuntimeContext::start(invalid().with_fails_deployment(true));
        assert!(matches!(result, Err(ContextError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_falls_back_to_defaults() {
        let context = RuntimeContext::start(invalid().with_fails_deployment(false)).unwrap();
        assert_eq!(
            context.config().threading.max_workers,
            ThreadingProfile::default().max_workers
        );
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let result = RuntimeContext::start(RuntimeConfig::default());
        assert!(matches!(result, Err(ContextError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_shutdown_flips_signal() {
        let context = RuntimeContext::start(RuntimeConfig::default()).unwrap();
        let signal = context.shutdown_signal();
        assert!(!*signal.borrow());

        context.shutdown();
        assert!(*signal.borrow());
        assert!(context.is_shutdown());
        assert!(context.health().status.is_unhealthy());
    }
}
