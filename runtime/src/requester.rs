//! Asynchronous request/reply requester.
//!
//! The requester turns a one-way asynchronous destination into a
//! request/response exchange. A request-response event is registered under
//! its correlation id, dispatched as a one-way copy that carries the
//! requester's reply handler, and the caller then waits for the correlated
//! reply.
//!
//! ```text
//! caller ──► requester ──register──► CorrelationRegistry
//!               │                          ▲
//!               └──dispatch (OneWay)──► listener ─ ─ ─► reply source
//!                                                          │
//!                 CorrelatingReplyToHandler ◄──────────────┘
//!                   └─► EventCorrelator ──aggregate──► resolve
//! ```
//!
//! Replies that arrive after the request completed or timed out find no
//! registration and are discarded.

use crate::aggregator::{AggregationPolicy, SingleResponseRouter};
use crate::config::{CancellationMode, RequesterConfig};
use crate::context::RuntimeContext;
use crate::correlation::WaitOutcome;
use crate::correlator::EventCorrelator;
use crate::health::{HealthCheck, HealthStatus};
use crate::reply::{CorrelatingReplyToHandler, ReplyListener, ReplyToHandlerDecorator};
use crate::retry::RetryPolicyTemplate;
use correlator_core::{
    CorrelationId, Event, ExceptionListener, ExchangePattern, MessageSource, MessagingError,
    MessagingExceptionHandler, ProcessResult, Processor, ReplyTo, ReplyToHandler,
};
use futures::future::BoxFuture;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Builder for [`AsyncRequestReplyRequester`].
pub struct RequesterBuilder {
    context: Arc<RuntimeContext>,
    name: String,
    config: RequesterConfig,
    policy: Arc<dyn AggregationPolicy>,
    exception_handler: Option<Arc<dyn MessagingExceptionHandler>>,
    exception_listener: Option<Arc<dyn ExceptionListener>>,
    listener: Option<Arc<dyn Processor>>,
}

impl RequesterBuilder {
    /// Name used in logs and health checks.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the requester settings taken from the context.
    #[must_use]
    pub const fn config(mut self, config: RequesterConfig) -> Self {
        self.config = config;
        self
    }

    /// Aggregation policy for replies (default: [`SingleResponseRouter`]).
    #[must_use]
    pub fn policy(mut self, policy: impl AggregationPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Run exception replies through `handler` before they reach the caller.
    #[must_use]
    pub fn exception_handler(mut self, handler: Arc<dyn MessagingExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Report failed and expired reply groups to `listener`.
    #[must_use]
    pub fn exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.exception_listener = Some(listener);
        self
    }

    /// Downstream processor requests are dispatched to.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn Processor>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the requester.
    #[must_use]
    pub fn build(self) -> AsyncRequestReplyRequester {
        let mut correlator = EventCorrelator::with_config(
            self.policy,
            Arc::clone(self.context.groups()),
            &self.context.config().correlator,
        );
        if let Some(listener) = self.exception_listener {
            correlator = correlator.with_exception_listener(listener);
        }
        let correlator = Arc::new(correlator);

        let correlating: Arc<dyn ReplyToHandler> = Arc::new(CorrelatingReplyToHandler::new(
            Arc::clone(&correlator),
            Arc::clone(self.context.correlations()),
        ));
        let reply_handler: Arc<dyn ReplyToHandler> = match self.exception_handler {
            Some(handler) => Arc::new(ReplyToHandlerDecorator::new(correlating, handler)),
            None => correlating,
        };

        tracing::debug!(
            requester = %self.name,
            policy = correlator.policy().name(),
            timeout_ms = self.config.timeout_ms,
            "Built async request/reply requester"
        );

        AsyncRequestReplyRequester {
            name: self.name,
            context: self.context,
            config: self.config,
            listener: RwLock::new(self.listener),
            correlator,
            reply_handler,
        }
    }
}

/// Correlates asynchronous replies with the requests that caused them.
pub struct AsyncRequestReplyRequester {
    name: String,
    context: Arc<RuntimeContext>,
    config: RequesterConfig,
    listener: RwLock<Option<Arc<dyn Processor>>>,
    correlator: Arc<EventCorrelator>,
    reply_handler: Arc<dyn ReplyToHandler>,
}

impl AsyncRequestReplyRequester {
    /// Start building a requester on `context`.
    ///
    /// Settings default to the context's requester configuration.
    #[must_use]
    pub fn builder(context: Arc<RuntimeContext>) -> RequesterBuilder {
        let config = context.config().requester.clone();
        RequesterBuilder {
            context,
            name: "requester".to_string(),
            config,
            policy: Arc::new(SingleResponseRouter::new()),
            exception_handler: None,
            exception_listener: None,
            listener: None,
        }
    }

    /// A requester with default settings.
    #[must_use]
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        Self::builder(context).build()
    }

    /// Replace the downstream processor.
    pub fn set_listener(&self, listener: Arc<dyn Processor>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Receive replies from `source`.
    pub fn set_reply_source(&self, source: &dyn MessageSource) {
        source.set_listener(Arc::new(ReplyListener::new(Arc::clone(&self.reply_handler))));
    }

    /// The handler attached to outgoing requests.
    #[must_use]
    pub fn reply_to_handler(&self) -> Arc<dyn ReplyToHandler> {
        Arc::clone(&self.reply_handler)
    }

    /// The correlator that collects replies, e.g. to spawn its timeout
    /// monitor.
    #[must_use]
    pub const fn correlator(&self) -> &Arc<EventCorrelator> {
        &self.correlator
    }

    /// Requester settings.
    #[must_use]
    pub const fn config(&self) -> &RequesterConfig {
        &self.config
    }

    /// Requests currently waiting for a reply, across the context.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.context.correlations().len()
    }

    /// Release the request waiting under `id` with a cancelled outcome.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.context.correlations().cancel(id)
    }

    /// Process an event.
    ///
    /// One-way events are dispatched and `Ok(None)` is returned. A
    /// request-response event waits for its correlated reply.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Dispatch`] if no listener is set
    /// - [`MessagingError::DuplicateCorrelation`] if the correlation id is
    ///   already waiting
    /// - [`MessagingError::ResponseTimeout`] if no reply arrives in time and
    ///   `fail_on_timeout` is set
    /// - [`MessagingError::Cancelled`] if the wait is cancelled and the
    ///   cancellation mode is `Error`
    /// - any error the listener returns or the reply source delivers
    #[tracing::instrument(
        skip(self, event),
        name = "requester_process",
        fields(
            requester = %self.name,
            event_id = %event.id(),
            pattern = ?event.exchange_pattern(),
        )
    )]
    pub async fn process(&self, event: Event) -> ProcessResult {
        let listener = self.listener()?;
        if !event.exchange_pattern().is_request_response() {
            listener.process(event).await?;
            return Ok(None);
        }
        self.request(listener.as_ref(), event).await
    }

    /// Process an event, retrying timed out exchanges with `template`.
    ///
    /// Only [`MessagingError::ResponseTimeout`] failures are retried; any
    /// other outcome ends the sequence at once.
    ///
    /// # Errors
    ///
    /// Returns the last timeout once the policy is exhausted, or the first
    /// non-timeout failure.
    pub async fn process_with_retry(
        &self,
        event: Event,
        template: &RetryPolicyTemplate,
    ) -> ProcessResult {
        let description = format!("request/reply via {}", self.name);
        let outcome = template
            .retry(&description, |attempt| {
                let event = event.clone();
                async move {
                    if attempt > 0 {
                        tracing::debug!(attempt, "Retrying timed out request");
                    }
                    match self.process(event).await {
                        Err(error) if error.is_timeout() => Err(anyhow::Error::new(error)),
                        other => Ok(other),
                    }
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(error) => {
                let summary = error.to_string();
                match error.into_last_error().map(anyhow::Error::downcast::<MessagingError>) {
                    Some(Ok(last)) => Err(last),
                    _ => Err(MessagingError::messaging(summary)),
                }
            },
        }
    }

    /// Health of this requester.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let has_listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        let check = if self.context.is_shutdown() {
            HealthCheck::unhealthy(&self.name, "runtime context is shut down")
        } else if has_listener {
            HealthCheck::new(&self.name, HealthStatus::Healthy)
        } else {
            HealthCheck::degraded(&self.name, "no listener configured")
        };
        check
            .with_metadata("pending_requests", self.pending())
            .with_metadata("open_groups", self.correlator.groups().len())
    }

    async fn request(&self, listener: &dyn Processor, event: Event) -> ProcessResult {
        let id = event
            .correlation_id()
            .cloned()
            .unwrap_or_else(CorrelationId::generate);
        let request = event.with_correlation_id(id.clone());

        let pending = self
            .context
            .correlations()
            .register(id.clone(), request.clone())?;
        // A reused id must not be mistaken for a group that already completed
        self.correlator.groups().forget_processed(&id);

        let outbound = request
            .clone()
            .with_exchange_pattern(ExchangePattern::OneWay)
            .with_reply_to(ReplyTo::new(Arc::clone(&self.reply_handler)));

        if let Err(error) = listener.process(outbound).await {
            drop(pending);
            self.correlator.discard(&id);
            tracing::warn!(correlation_id = %id, %error, "Dispatch of request failed");
            return Err(error);
        }

        let timeout = request.timeout().or_else(|| self.config.timeout());
        let outcome = if self.config.fail_on_timeout {
            pending.wait(timeout).await
        } else {
            let correlator = &self.correlator;
            pending
                .wait_or_settle(timeout, |registry, id| {
                    correlator.settle(id, |partial| {
                        partial.is_some_and(|result| {
                            registry.resolve(id, result.map(Event::without_reply_to))
                        })
                    })
                })
                .await
        };
        match outcome {
            WaitOutcome::Reply(result) => result.map(Some),
            WaitOutcome::TimedOut => self.timed_out(id, request, timeout.unwrap_or_default()),
            WaitOutcome::Cancelled => self.cancelled(id),
        }
    }

    fn timed_out(&self, id: CorrelationId, request: Event, timeout: Duration) -> ProcessResult {
        if !self.config.fail_on_timeout {
            // settle found nothing to hand over
            tracing::info!(correlation_id = %id, ?timeout, "Reply timed out with no partial result");
            return Ok(None);
        }
        self.correlator.discard(&id);
        tracing::warn!(correlation_id = %id, ?timeout, "No reply received in time");
        Err(MessagingError::ResponseTimeout {
            correlation_id: id,
            timeout,
            event: Box::new(request),
        })
    }

    fn cancelled(&self, id: CorrelationId) -> ProcessResult {
        self.correlator.discard(&id);
        tracing::debug!(correlation_id = %id, mode = ?self.config.cancellation, "Wait cancelled");
        match self.config.cancellation {
            CancellationMode::Error => Err(MessagingError::Cancelled { correlation_id: id }),
            CancellationMode::ReturnNone => Ok(None),
        }
    }

    fn listener(&self) -> Result<Arc<dyn Processor>, MessagingError> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| MessagingError::Dispatch(format!("{} has no listener", self.name)))
    }
}

impl Processor for AsyncRequestReplyRequester {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        Box::pin(Self::process(self, event))
    }
}

impl std::fmt::Debug for AsyncRequestReplyRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRequestReplyRequester")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("correlator", &self.correlator)
            .finish_non_exhaustive()
    }
}
