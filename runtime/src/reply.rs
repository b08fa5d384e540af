//! Reply handlers that feed asynchronous replies back to waiting requests.
//!
//! [`CorrelatingReplyToHandler`] is what the requester attaches to every
//! outgoing request. Replies go through the event correlator; once a group
//! aggregates, the result is handed to the waiting request through the
//! correlation registry. [`ReplyToHandlerDecorator`] runs failures through an
//! exception strategy first, and [`ReplyListener`] adapts a reply handler to
//! a reply-source listener.

use crate::correlation::CorrelationRegistry;
use crate::correlator::EventCorrelator;
use correlator_core::{
    Event, ExceptionOutcome, Message, MessagingError, MessagingExceptionHandler, ProcessResult,
    Processor, ReplyToHandler,
};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Routes replies through the correlator and wakes the matching request.
#[derive(Debug, Clone)]
pub struct CorrelatingReplyToHandler {
    correlator: Arc<EventCorrelator>,
    registry: Arc<CorrelationRegistry>,
}

impl CorrelatingReplyToHandler {
    /// Create a handler over `correlator` and `registry`.
    #[must_use]
    pub const fn new(correlator: Arc<EventCorrelator>, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            correlator,
            registry,
        }
    }
}

impl ReplyToHandler for CorrelatingReplyToHandler {
    fn process_reply_to(&self, reply: Event, _original: Option<Message>) {
        let Some(id) = reply.correlation_id().cloned() else {
            tracing::warn!(event_id = %reply.id(), "Reply carries no correlation id, dropping it");
            return;
        };
        if !self.registry.contains(&id) {
            tracing::debug!(
                correlation_id = %id,
                "Reply arrived after its request completed, discarding"
            );
            return;
        }

        // Resolved under the group lock, ordered against EventCorrelator::settle
        let registry = &self.registry;
        match self.correlator.add_event_then(reply, |aggregated| {
            registry.resolve(&id, aggregated.map(Event::without_reply_to))
        }) {
            Ok(Some(_)) => {},
            Ok(None) => {
                tracing::trace!(correlation_id = %id, "Reply buffered, group still collecting");
            },
            Err(error) => {
                registry.resolve(&id, Err(error));
            },
        }
    }

    fn process_exception_reply_to(&self, error: MessagingError) {
        let Some(id) = error.event().and_then(Event::correlation_id).cloned() else {
            tracing::warn!(%error, "Exception reply cannot be correlated, dropping it");
            return;
        };
        // Buffered partial replies are meaningless once the request failed
        self.correlator.discard(&id);
        self.registry.resolve(&id, Err(error));
    }
}

/// Runs exception replies through an exception strategy before delegating.
///
/// A handled failure is turned into a regular reply carrying the strategy's
/// substitute event; an unhandled one is passed on as a failure.
pub struct ReplyToHandlerDecorator {
    delegate: Arc<dyn ReplyToHandler>,
    exception_handler: Arc<dyn MessagingExceptionHandler>,
}

impl ReplyToHandlerDecorator {
    /// Decorate `delegate` with `exception_handler`.
    #[must_use]
    pub fn new(
        delegate: Arc<dyn ReplyToHandler>,
        exception_handler: Arc<dyn MessagingExceptionHandler>,
    ) -> Self {
        Self {
            delegate,
            exception_handler,
        }
    }
}

impl ReplyToHandler for ReplyToHandlerDecorator {
    fn process_reply_to(&self, reply: Event, original: Option<Message>) {
        self.delegate.process_reply_to(reply, original);
    }

    fn process_exception_reply_to(&self, error: MessagingError) {
        let Some(event) = error.event().cloned() else {
            self.delegate.process_exception_reply_to(error);
            return;
        };
        match self.exception_handler.handle_exception(&error, event) {
            ExceptionOutcome::Handled(substitute) => {
                tracing::debug!(%error, "Exception reply handled by exception strategy");
                self.delegate.process_reply_to(substitute, None);
            },
            ExceptionOutcome::Unhandled(event) => {
                self.delegate
                    .process_exception_reply_to(error.with_event(event));
            },
        }
    }
}

impl std::fmt::Debug for ReplyToHandlerDecorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyToHandlerDecorator")
            .finish_non_exhaustive()
    }
}

/// Listener for a reply source that hands every event to a reply handler.
pub struct ReplyListener {
    handler: Arc<dyn ReplyToHandler>,
}

impl ReplyListener {
    /// Forward to `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn ReplyToHandler>) -> Self {
        Self { handler }
    }
}

impl Processor for ReplyListener {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        self.handler.process_reply_to(event, None);
        Box::pin(async { Ok(None) })
    }
}

impl std::fmt::Debug for ReplyListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyListener").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregationPolicy, ResponseCorrelationAggregator, SingleResponseRouter};
    use crate::correlation::WaitOutcome;
    use crate::correlator::GroupRegistry;
    use correlator_core::CorrelationId;
    use std::time::Duration;

    fn wire(
        policy: Arc<dyn AggregationPolicy>,
    ) -> (Arc<CorrelationRegistry>, CorrelatingReplyToHandler) {
        let registry = Arc::new(CorrelationRegistry::new());
        let correlator = Arc::new(EventCorrelator::new(
            policy,
            Arc::new(GroupRegistry::default()),
        ));
        let handler = CorrelatingReplyToHandler::new(correlator, Arc::clone(&registry));
        (registry, handler)
    }

    fn request(id: &str) -> Event {
        Event::new(Message::text("req")).with_correlation_id(CorrelationId::from(id))
    }

    struct Recover(bool);

    impl MessagingExceptionHandler for Recover {
        fn handle_exception(&self, _error: &MessagingError, event: Event) -> ExceptionOutcome {
            if self.0 {
                ExceptionOutcome::Handled(event.derive(Message::text("recovered")))
            } else {
                ExceptionOutcome::Unhandled(event)
            }
        }
    }

    #[tokio::test]
    async fn test_single_reply_wakes_request() {
        let (registry, handler) = wire(Arc::new(SingleResponseRouter::new()));
        let id = CorrelationId::from("r1");
        let pending = registry.register(id.clone(), request("r1")).unwrap();

        handler.process_reply_to(request("r1").derive(Message::text("pong")), None);

        match pending.wait(Some(Duration::from_secs(1))).await {
            WaitOutcome::Reply(Ok(reply)) => assert_eq!(reply.message_as_string(), "pong"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_group_resolves_after_last_reply() {
        let (registry, handler) = wire(Arc::new(ResponseCorrelationAggregator::new()));
        let id = CorrelationId::from("r2");
        let pending = registry.register(id.clone(), request("r2")).unwrap();
        let base = request("r2").with_correlation_group_size(2);

        handler.process_reply_to(base.derive(Message::text("a")).with_correlation_sequence(0), None);
        assert!(registry.contains(&id));
        handler.process_reply_to(base.derive(Message::text("b")).with_correlation_sequence(1), None);

        match pending.wait(None).await {
            WaitOutcome::Reply(Ok(reply)) => assert_eq!(reply.message_as_string(), "[a,b]"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_reply_without_waiter_is_discarded() {
        let (registry, handler) = wire(Arc::new(SingleResponseRouter::new()));
        handler.process_reply_to(request("nobody").derive(Message::text("late")), None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_exception_reply_fails_request() {
        let (registry, handler) = wire(Arc::new(SingleResponseRouter::new()));
        let id = CorrelationId::from("r3");
        let pending = registry.register(id.clone(), request("r3")).unwrap();

        handler.process_exception_reply_to(
            MessagingError::messaging("boom").with_event(request("r3")),
        );

        assert!(matches!(
            pending.wait(None).await,
            WaitOutcome::Reply(Err(MessagingError::Messaging { .. }))
        ));
    }

    #[tokio::test]
    async fn test_decorator_turns_handled_failure_into_reply() {
        let (registry, handler) = wire(Arc::new(SingleResponseRouter::new()));
        let decorator = ReplyToHandlerDecorator::new(Arc::new(handler), Arc::new(Recover(true)));
        let id = CorrelationId::from("r4");
        let pending = registry.register(id.clone(), request("r4")).unwrap();

        decorator.process_exception_reply_to(
            MessagingError::messaging("boom").with_event(request("r4")),
        );

        match pending.wait(None).await {
            WaitOutcome::Reply(Ok(reply)) => assert_eq!(reply.message_as_string(), "recovered"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decorator_passes_unhandled_failure_on() {
        let (registry, handler) = wire(Arc::new(SingleResponseRouter::new()));
        let decorator = ReplyToHandlerDecorator::new(Arc::new(handler), Arc::new(Recover(false)));
        let id = CorrelationId::from("r5");
        let pending = registry.register(id.clone(), request("r5")).unwrap();

        decorator.process_exception_reply_to(
            MessagingError::messaging("boom").with_event(request("r5")),
        );

        assert!(matches!(pending.wait(None).await, WaitOutcome::Reply(Err(_))));
    }

    #[tokio::test]
    async fn test_reply_listener_forwards_to_handler() {
        let (registry, handler) = wire(Arc::new(SingleResponseRouter::new()));
        let listener = ReplyListener::new(Arc::new(handler));
        let id = CorrelationId::from("r6");
        let pending = registry.register(id.clone(), request("r6")).unwrap();

        let result = listener.process(request("r6").derive(Message::text("via source"))).await;

        assert_eq!(result.unwrap(), None);
        assert!(matches!(pending.wait(None).await, WaitOutcome::Reply(Ok(_))));
    }
}
