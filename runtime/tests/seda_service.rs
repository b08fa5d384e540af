//! Integration tests for queued (SEDA) services
//!
//! Includes the full asynchronous loop: a requester dispatching to a SEDA
//! service whose worker answers through the reply-to handler.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use correlator_core::{
    Event, EventId, ExchangePattern, FlowIdentity, FnProcessor, Message, MessagingError,
    Processor,
};
use correlator_runtime::config::QueueConfiguration;
use correlator_runtime::queue::{EventHolder, MemoryPersistenceStrategy, QueueManager};
use correlator_runtime::{
    AsyncRequestReplyRequester, RuntimeConfig, RuntimeContext, SedaService, ThreadingProfile,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

fn context(profile: ThreadingProfile) -> Arc<RuntimeContext> {
    correlator_testing::init_test_tracing();
    RuntimeContext::start(RuntimeConfig::default().with_threading(profile)).unwrap()
}

fn profile() -> ThreadingProfile {
    ThreadingProfile::default()
        .with_max_workers(4)
        .with_max_redelivery(1)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn upper() -> Arc<dyn Processor> {
    Arc::new(FnProcessor::new(|event: Event| {
        let text = event.message_as_string().to_uppercase();
        Ok(Some(event.derive(Message::text(text))))
    }))
}

// ============================================================================
// Request/reply through a queue
// ============================================================================

#[tokio::test]
async fn test_requester_gets_reply_from_queued_service() {
    let context = context(profile());
    let seda = Arc::new(SedaService::new("pricing", Arc::clone(&context), upper()));
    seda.start().unwrap();
    let requester = AsyncRequestReplyRequester::builder(Arc::clone(&context))
        .listener(seda.clone())
        .build();

    let request =
        Event::new(Message::text("quote")).with_exchange_pattern(ExchangePattern::RequestResponse);
    let reply = requester.process(request).await.unwrap().unwrap();

    assert_eq!(reply.message_as_string(), "QUOTE");
    assert!(reply.reply_to().is_none());
    assert_eq!(requester.pending(), 0);
    eventually(|| seda.queued() == 0).await;
}

#[tokio::test]
async fn test_exhausted_redelivery_fails_waiting_request() {
    let context = context(profile());
    let calls = Arc::new(AtomicUsize::new(0));
    let component = {
        let calls = Arc::clone(&calls);
        Arc::new(FnProcessor::new(move |event: Event| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MessagingError::messaging("pricing engine offline").with_event(event))
        }))
    };
    let seda = Arc::new(SedaService::new("pricing", Arc::clone(&context), component));
    seda.start().unwrap();
    let requester = AsyncRequestReplyRequester::builder(Arc::clone(&context))
        .listener(seda.clone())
        .build();

    let request =
        Event::new(Message::text("quote")).with_exchange_pattern(ExchangePattern::RequestResponse);
    let error = requester.process(request).await.unwrap_err();

    assert!(error.to_string().contains("pricing engine offline"));
    // First delivery plus one redelivery
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(seda.dead_letters().len(), 1);
    assert!(seda.dead_letters().peek().unwrap().payload.reply_to().is_none());
}

// ============================================================================
// Workers
// ============================================================================

#[tokio::test]
async fn test_every_item_is_processed_exactly_once() {
    let context = context(profile());
    let seen: Arc<Mutex<Vec<EventId>>> = Arc::default();
    let component = {
        let seen = Arc::clone(&seen);
        Arc::new(FnProcessor::new(move |event: Event| {
            seen.lock().unwrap().push(event.id());
            Ok(None)
        }))
    };
    let seda = SedaService::new("audit", Arc::clone(&context), component);
    seda.start().unwrap();

    let mut sent = HashSet::new();
    for n in 0..50 {
        let event = Event::new(Message::text(format!("entry-{n}")));
        sent.insert(event.id());
        seda.process(event).await.unwrap();
    }

    eventually(|| seen.lock().unwrap().len() >= 50).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 50);
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), sent);
}

#[tokio::test]
async fn test_persisted_items_are_processed_after_restart() {
    let store = MemoryPersistenceStrategy::new();
    let config = QueueConfiguration::new().with_persistent(true);

    // Items left behind by a previous run
    let previous = QueueManager::with_persistence(config, Arc::new(store.clone()));
    previous.start().unwrap();
    for n in 0..3 {
        let event = Event::new(Message::text(format!("left-{n}")))
            .with_flow(FlowIdentity::new("billing", "seda://billing"));
        previous
            .session()
            .queue("billing")
            .put(EventHolder::from_event(&event).unwrap())
            .await
            .unwrap();
    }
    previous.stop();

    let context = context(profile());
    let processed = Arc::new(AtomicUsize::new(0));
    let component = {
        let processed = Arc::clone(&processed);
        Arc::new(FnProcessor::new(move |_event: Event| {
            processed.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }))
    };
    let seda = SedaService::new("billing", Arc::clone(&context), component)
        .with_queue_manager(QueueManager::with_persistence(config, Arc::new(store.clone())));

    assert_eq!(seda.start().unwrap(), 3);
    eventually(|| processed.load(Ordering::SeqCst) == 3).await;
    eventually(|| store.is_empty()).await;
}

#[tokio::test]
async fn test_health_reports_queue_and_workers() {
    let context = context(profile());
    let seda = SedaService::new("reports", Arc::clone(&context), upper());

    assert!(seda.health().status.is_unhealthy());
    seda.start().unwrap();
    let health = seda.health();
    assert!(health.status.is_healthy());
    assert!(
        health
            .metadata
            .iter()
            .any(|(key, value)| key == "running" && value == "true")
    );

    seda.stop();
    assert!(!seda.is_running());
}
