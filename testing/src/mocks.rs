//! Test doubles for the collaborators of the correlation runtime.
//!
//! Listeners stand in for asynchronous destinations, recorders capture what
//! exception strategies, exception listeners and retry notifiers were told,
//! and [`ManualReplySource`] lets a test push replies by hand.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use correlator_core::{
    Event, ExceptionListener, ExceptionOutcome, Message, MessageSource, MessagingError,
    MessagingExceptionHandler, ProcessResult, Processor, PropertyScope,
};
use correlator_runtime::{RetryContext, RetryNotifier};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Destination that answers every request through its reply-to handler.
///
/// Each reply is derived from the request, so it keeps the correlation id.
/// With a group size above one the listener sends that many numbered
/// replies, which is what an aggregating requester waits for.
///
/// # Example
///
/// ```
/// use correlator_core::{Event, Message, Processor};
/// use correlator_testing::mocks::EchoListener;
///
/// # tokio_test::block_on(async {
/// let echo = EchoListener::new().with_prefix("re: ");
/// echo.process(Event::new(Message::text("ping"))).await.unwrap();
/// assert_eq!(echo.received().len(), 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct EchoListener {
    prefix: String,
    delay: Option<Duration>,
    replies: usize,
    received: Arc<Mutex<Vec<Event>>>,
}

impl EchoListener {
    /// Reply once, inline, with the request text.
    #[must_use]
    pub fn new() -> Self {
        Self {
            replies: 1,
            ..Self::default()
        }
    }

    /// Prefix each reply's text.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Reply from a spawned task after `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Send `count` replies forming one group of size `count`.
    #[must_use]
    pub const fn with_replies(mut self, count: usize) -> Self {
        self.replies = count;
        self
    }

    /// Requests seen so far.
    #[must_use]
    pub fn received(&self) -> Vec<Event> {
        self.received.lock().unwrap().clone()
    }

    fn replies_for(&self, request: &Event) -> Vec<Event> {
        let text = request.message_as_string();
        (0..self.replies)
            .map(|sequence| {
                let body = if self.replies == 1 {
                    format!("{}{text}", self.prefix)
                } else {
                    format!("{}{text}-{sequence}", self.prefix)
                };
                let reply = request.derive(Message::text(body));
                if self.replies == 1 {
                    reply
                } else {
                    reply
                        .with_correlation_group_size(self.replies)
                        .with_correlation_sequence(sequence)
                }
            })
            .collect()
    }
}

impl Processor for EchoListener {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        self.received.lock().unwrap().push(event.clone());
        let replies = self.replies_for(&event);
        let delay = self.delay;

        Box::pin(async move {
            let Some(reply_to) = event.reply_to().cloned() else {
                return Ok(None);
            };
            let original = event.message().clone();
            let send = move || {
                for reply in replies {
                    reply_to
                        .handler()
                        .process_reply_to(reply, Some(original.clone()));
                }
            };
            match delay {
                Some(delay) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        send();
                    });
                },
                None => send(),
            }
            Ok(None)
        })
    }
}

/// Destination that accepts every request and never answers.
#[derive(Debug, Clone, Default)]
pub struct SilentListener {
    received: Arc<Mutex<Vec<Event>>>,
}

impl SilentListener {
    /// Create a listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests seen so far.
    #[must_use]
    pub fn received(&self) -> Vec<Event> {
        self.received.lock().unwrap().clone()
    }
}

impl Processor for SilentListener {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        self.received.lock().unwrap().push(event);
        Box::pin(async { Ok(None) })
    }
}

/// How a [`FailingListener`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Dispatch itself fails
    Dispatch,
    /// Dispatch succeeds and the failure comes back as an exception reply
    ExceptionReply,
}

/// Destination that fails every request.
#[derive(Debug, Clone)]
pub struct FailingListener {
    mode: FailureMode,
    message: String,
    calls: Arc<AtomicUsize>,
}

impl FailingListener {
    /// Fail in `mode` with `message`.
    #[must_use]
    pub fn new(mode: FailureMode, message: impl Into<String>) -> Self {
        Self {
            mode,
            message: message.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of requests received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for FailingListener {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match (self.mode, event.reply_to()) {
            (FailureMode::ExceptionReply, Some(reply_to)) => {
                let error = MessagingError::messaging(self.message.clone()).with_event(event.clone());
                reply_to.handler().process_exception_reply_to(error);
                Ok(None)
            },
            _ => Err(MessagingError::Dispatch(self.message.clone())),
        };
        Box::pin(async move { result })
    }
}

/// Exception strategy that records what it saw and answers with a fixed
/// outcome.
#[derive(Debug, Clone)]
pub struct RecordingExceptionHandler {
    substitute: Option<String>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl RecordingExceptionHandler {
    /// Handle every failure, replacing the event's message with `substitute`.
    #[must_use]
    pub fn handling(substitute: impl Into<String>) -> Self {
        Self {
            substitute: Some(substitute.into()),
            seen: Arc::default(),
        }
    }

    /// Leave every failure unhandled, tagging the event's message with
    /// `"handled-by-strategy"` so tests can tell it was the strategy's event.
    #[must_use]
    pub fn unhandled() -> Self {
        Self {
            substitute: None,
            seen: Arc::default(),
        }
    }

    /// Messages of the failures seen so far.
    #[must_use]
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl MessagingExceptionHandler for RecordingExceptionHandler {
    fn handle_exception(&self, error: &MessagingError, event: Event) -> ExceptionOutcome {
        self.seen.lock().unwrap().push(error.to_string());
        match &self.substitute {
            Some(text) => ExceptionOutcome::Handled(event.derive(Message::text(text.clone()))),
            None => {
                let tagged =
                    event
                        .message()
                        .with_property(PropertyScope::Invocation, "handled-by-strategy", true);
                ExceptionOutcome::Unhandled(event.with_message(tagged))
            },
        }
    }
}

/// Exception listener that records every failure.
#[derive(Debug, Clone, Default)]
pub struct RecordingExceptionListener {
    errors: Arc<Mutex<Vec<MessagingError>>>,
}

impl RecordingExceptionListener {
    /// Create a listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Failures seen so far.
    #[must_use]
    pub fn errors(&self) -> Vec<MessagingError> {
        self.errors.lock().unwrap().clone()
    }
}

impl ExceptionListener for RecordingExceptionListener {
    fn exception_thrown(&self, error: &MessagingError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

/// Retry notifier that counts calls.
#[derive(Debug, Clone, Default)]
pub struct RecordingRetryNotifier {
    failures: Arc<Mutex<Vec<String>>>,
    successes: Arc<AtomicUsize>,
}

impl RecordingRetryNotifier {
    /// Create a notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure messages, one per failed attempt.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    /// Number of successful sequences.
    #[must_use]
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }
}

impl RetryNotifier for RecordingRetryNotifier {
    fn on_failure(&self, _context: &RetryContext, cause: &anyhow::Error) {
        self.failures.lock().unwrap().push(cause.to_string());
    }

    fn on_success(&self, _context: &RetryContext) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reply source driven by the test.
#[derive(Default)]
pub struct ManualReplySource {
    listener: Mutex<Option<Arc<dyn Processor>>>,
}

impl ManualReplySource {
    /// Create a source with no listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a listener was registered.
    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }

    /// Hand `reply` to the registered listener.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Dispatch`] when no listener is registered,
    /// or whatever the listener returns.
    pub async fn deliver(&self, reply: Event) -> ProcessResult {
        let listener = self.listener.lock().unwrap().clone();
        match listener {
            Some(listener) => listener.process(reply).await,
            None => Err(MessagingError::Dispatch("reply source has no listener".to_string())),
        }
    }
}

impl MessageSource for ManualReplySource {
    fn set_listener(&self, listener: Arc<dyn Processor>) {
        *self.listener.lock().unwrap() = Some(listener);
    }
}

impl std::fmt::Debug for ManualReplySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualReplySource")
            .field("has_listener", &self.has_listener())
            .finish()
    }
}
