//! Integration tests for retrying timed out request/reply exchanges

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use correlator_core::{Event, ExchangePattern, Message, MessagingError, ProcessResult, Processor};
use correlator_runtime::{
    AsyncRequestReplyRequester, RequesterConfig, RetryConfig, RetryPolicyTemplate, RuntimeConfig,
    RuntimeContext, SimpleRetryPolicy,
};
use correlator_testing::mocks::{FailingListener, FailureMode, RecordingRetryNotifier, SilentListener};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Ignores the first `silent_for` requests, then echoes.
#[derive(Default)]
struct WakesUpLate {
    silent_for: usize,
    calls: AtomicUsize,
}

impl Processor for WakesUpLate {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.silent_for {
            if let Some(reply_to) = event.reply_to() {
                let reply = event.derive(Message::text(format!("answered on call {call}")));
                reply_to.handler().process_reply_to(reply, None);
            }
        }
        Box::pin(async { Ok(None) })
    }
}

fn requester(listener: Arc<dyn Processor>) -> AsyncRequestReplyRequester {
    correlator_testing::init_test_tracing();
    let context = RuntimeContext::start(RuntimeConfig::default()).unwrap();
    AsyncRequestReplyRequester::builder(context)
        .config(RequesterConfig::default().with_timeout_ms(100))
        .listener(listener)
        .build()
}

fn request() -> Event {
    Event::new(Message::text("quote")).with_exchange_pattern(ExchangePattern::RequestResponse)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timed_out_exchange_is_retried_until_answered() {
    let destination = Arc::new(WakesUpLate {
        silent_for: 2,
        ..WakesUpLate::default()
    });
    let requester = requester(destination.clone());
    let notifier = RecordingRetryNotifier::new();
    let template = RetryPolicyTemplate::new(SimpleRetryPolicy::bounded(2, Duration::from_millis(50)))
        .with_notifier(Arc::new(notifier.clone()));

    let reply = requester
        .process_with_retry(request(), &template)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.message_as_string(), "answered on call 2");
    assert_eq!(destination.calls.load(Ordering::SeqCst), 3);
    assert_eq!(notifier.failures().len(), 2);
    assert_eq!(notifier.successes(), 1);
    assert_eq!(requester.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_return_last_timeout() {
    let silent = SilentListener::new();
    let requester = requester(Arc::new(silent.clone()));
    let template = RetryPolicyTemplate::from_config(&RetryConfig {
        max_retries: 2,
        frequency_ms: 10,
    });

    let started = tokio::time::Instant::now();
    let error = requester
        .process_with_retry(request(), &template)
        .await
        .unwrap_err();

    assert!(matches!(error, MessagingError::ResponseTimeout { .. }));
    assert_eq!(silent.received().len(), 3);
    // Three waits of 100ms and two pauses of 10ms
    assert!(started.elapsed() >= Duration::from_millis(320));
    assert_eq!(requester.pending(), 0);
}

#[tokio::test]
async fn test_non_timeout_failure_is_not_retried() {
    let failing = FailingListener::new(FailureMode::Dispatch, "no route");
    let requester = requester(Arc::new(failing.clone()));
    let notifier = RecordingRetryNotifier::new();
    let template = RetryPolicyTemplate::new(SimpleRetryPolicy::bounded(5, Duration::from_millis(1)))
        .with_notifier(Arc::new(notifier.clone()));

    let error = requester
        .process_with_retry(request(), &template)
        .await
        .unwrap_err();

    assert!(matches!(error, MessagingError::Dispatch(_)));
    assert_eq!(failing.calls(), 1);
    assert!(notifier.failures().is_empty());
}

#[tokio::test]
async fn test_template_retries_arbitrary_work() {
    let template = RetryPolicyTemplate::new(SimpleRetryPolicy::bounded(3, Duration::from_millis(1)));
    let attempts = AtomicUsize::new(0);

    let value = template
        .retry("connect", |attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    anyhow::bail!("refused on attempt {attempt}");
                }
                Ok(attempt * 10)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 20);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
