//! Collaborator contracts at the edges of the kernel.
//!
//! Transports, components and exception strategies are out of scope; the
//! kernel reaches them only through these traits.
//!
//! # Example
//!
//! ```
//! use correlator_core::event::Event;
//! use correlator_core::message::Message;
//! use correlator_core::processor::{FnProcessor, Processor};
//!
//! # tokio_test::block_on(async {
//! let upper = FnProcessor::new(|event: Event| {
//!     let text = event.message_as_string().to_uppercase();
//!     Ok(Some(event.derive(Message::text(text))))
//! });
//!
//! let result = upper.process(Event::new(Message::text("hi"))).await;
//! assert_eq!(result.ok().flatten().map(|e| e.message_as_string()), Some("HI".to_string()));
//! # });
//! ```

use crate::error::MessagingError;
use crate::event::Event;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Result of processing one event: an optional result event or a failure.
pub type ProcessResult = Result<Option<Event>, MessagingError>;

/// Something that accepts events.
///
/// Dispatch may complete on the caller's task or hand off to another one;
/// callers must not assume which.
pub trait Processor: Send + Sync {
    /// Process an event.
    ///
    /// # Errors
    ///
    /// Returns a [`MessagingError`] when processing fails.
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult>;
}

impl<P: Processor + ?Sized> Processor for Arc<P> {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        (**self).process(event)
    }
}

/// Origin of events, e.g. the reply channel of a transport.
pub trait MessageSource: Send + Sync {
    /// Register the processor that receives every event from this source.
    fn set_listener(&self, listener: Arc<dyn Processor>);
}

/// Processor backed by a synchronous closure.
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(Event) -> ProcessResult + Send + Sync,
{
    /// Wrap a closure.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(Event) -> ProcessResult + Send + Sync,
{
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        let result = (self.f)(event);
        Box::pin(async move { result })
    }
}

/// Outcome of running a failure through an exception strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum ExceptionOutcome {
    /// The strategy recovered; the event is the substitute result
    Handled(Event),
    /// The strategy did not recover; the failure stands for this event
    Unhandled(Event),
}

/// Pluggable exception strategy.
pub trait MessagingExceptionHandler: Send + Sync {
    /// Decide whether `error`, raised while processing `event`, is handled.
    fn handle_exception(&self, error: &MessagingError, event: Event) -> ExceptionOutcome;
}

/// Observer for failures that cannot be returned to any caller, such as an
/// expired or unaggregatable event group.
pub trait ExceptionListener: Send + Sync {
    /// Called once per failure.
    fn exception_thrown(&self, error: &MessagingError);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn test_fn_processor_propagates_error() {
        let failing = FnProcessor::new(|_event: Event| Err(MessagingError::messaging("nope")));
        let result = failing.process(Event::new(Message::text("x"))).await;
        assert!(matches!(result, Err(MessagingError::Messaging { .. })));
    }

    #[tokio::test]
    async fn test_arc_processor_delegates() {
        let inner: Arc<dyn Processor> = Arc::new(FnProcessor::new(|_event: Event| Ok(None)));
        let wrapped = Arc::new(inner);
        let result = wrapped.process(Event::new(Message::text("x"))).await;
        assert!(matches!(result, Ok(None)));
    }
}
