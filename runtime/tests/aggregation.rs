//! Integration tests for event-group aggregation
//!
//! Covers N-way readiness under concurrent arrival, multi-reply requests and
//! group expiry.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use correlator_core::{CorrelationId, Event, ExchangePattern, Message, MessagingError};
use correlator_runtime::aggregator::{ConcatenationStrategy, ResponseCorrelationAggregator};
use correlator_runtime::dlq::DeadLetterQueue;
use correlator_runtime::{
    AsyncRequestReplyRequester, EventCorrelator, GroupRegistry, RequesterConfig, RuntimeConfig,
    RuntimeContext,
};
use correlator_testing::mocks::{EchoListener, RecordingExceptionListener};
use correlator_testing::properties::{group_arrivals, group_events};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

fn correlator() -> EventCorrelator {
    EventCorrelator::new(
        Arc::new(ResponseCorrelationAggregator::new()),
        Arc::new(GroupRegistry::default()),
    )
}

/// Feed `order` into `correlator` from `threads` threads, round-robin.
fn feed_concurrently(
    correlator: &EventCorrelator,
    events: &[Event],
    order: &[usize],
    threads: usize,
) -> Vec<Event> {
    let results = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        for lane in 0..threads {
            let results = &results;
            scope.spawn(move || {
                for index in order.iter().skip(lane).step_by(threads) {
                    if let Some(aggregate) = correlator.add_event(events[*index].clone()).unwrap() {
                        results.lock().unwrap().push(aggregate);
                    }
                }
            });
        }
    });
    results.into_inner().unwrap()
}

// ============================================================================
// Readiness
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn group_aggregates_exactly_once_for_any_arrival(
        (size, order) in group_arrivals(),
        threads in 1_usize..=4,
    ) {
        let correlator = correlator();
        let id = CorrelationId::from("order-1");
        let events = group_events(&id, size);

        let results = feed_concurrently(&correlator, &events, &order, threads);

        prop_assert_eq!(results.len(), 1);
        prop_assert_eq!(results[0].message().payload().collection_len(), Some(size));
        prop_assert!(correlator.groups().is_processed(&id));
        prop_assert!(correlator.groups().is_empty());
    }

    #[test]
    fn redelivered_events_never_aggregate_twice((size, order) in group_arrivals()) {
        let correlator = correlator();
        let id = CorrelationId::from("order-2");
        let events = group_events(&id, size);

        let mut completed = 0;
        for index in order.iter().chain(order.iter()) {
            if correlator.add_event(events[*index].clone()).unwrap().is_some() {
                completed += 1;
            }
        }
        prop_assert_eq!(completed, 1);
    }
}

#[test]
fn test_aggregate_is_ordered_by_sequence() {
    let correlator = EventCorrelator::new(
        Arc::new(ResponseCorrelationAggregator::with_strategy(
            ConcatenationStrategy::new(","),
        )),
        Arc::new(GroupRegistry::default()),
    );
    let id = CorrelationId::from("ordered");
    let events = group_events(&id, 3);

    assert!(correlator.add_event(events[2].clone()).unwrap().is_none());
    assert!(correlator.add_event(events[0].clone()).unwrap().is_none());
    let result = correlator.add_event(events[1].clone()).unwrap().unwrap();

    assert_eq!(result.message_as_string(), "part-0,part-1,part-2");
    assert_eq!(result.correlation_id(), Some(&id));
}

#[test]
fn test_event_without_correlation_id_is_rejected() {
    let error = correlator()
        .add_event(Event::new(Message::text("stray")))
        .unwrap_err();
    assert!(matches!(error, MessagingError::NoCorrelationId { .. }));
}

// ============================================================================
// Multi-reply requests
// ============================================================================

#[tokio::test]
async fn test_requester_waits_for_every_reply() {
    correlator_testing::init_test_tracing();
    let context = RuntimeContext::start(RuntimeConfig::default()).unwrap();
    let requester = AsyncRequestReplyRequester::builder(context)
        .policy(ResponseCorrelationAggregator::with_strategy(
            ConcatenationStrategy::new("|"),
        ))
        .listener(Arc::new(
            EchoListener::new()
                .with_replies(5)
                .with_delay(Duration::from_millis(1)),
        ))
        .build();

    let request = Event::new(Message::text("bid"))
        .with_exchange_pattern(ExchangePattern::RequestResponse);
    let reply = requester.process(request).await.unwrap().unwrap();

    assert_eq!(reply.message_as_string(), "bid-0|bid-1|bid-2|bid-3|bid-4");
    assert_eq!(requester.pending(), 0);
    assert!(requester.correlator().groups().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partial_replies_on_timeout_without_failure() {
    correlator_testing::init_test_tracing();
    let context = RuntimeContext::start(RuntimeConfig::default()).unwrap();
    let requester = AsyncRequestReplyRequester::builder(context)
        .config(
            RequesterConfig::default()
                .with_timeout_ms(50)
                .with_fail_on_timeout(false),
        )
        .policy(ResponseCorrelationAggregator::new())
        .listener(Arc::new(PartialEcho))
        .build();

    let request = Event::new(Message::text("bid"))
        .with_exchange_pattern(ExchangePattern::RequestResponse);
    let reply = requester.process(request).await.unwrap().unwrap();

    assert_eq!(reply.message().payload().collection_len(), Some(2));
    assert_eq!(requester.pending(), 0);
}

/// Announces three replies but only ever sends two.
struct PartialEcho;

impl correlator_core::Processor for PartialEcho {
    fn process(
        &self,
        event: Event,
    ) -> futures::future::BoxFuture<'_, correlator_core::ProcessResult> {
        if let Some(reply_to) = event.reply_to() {
            for sequence in 0..2 {
                let reply = event
                    .derive(Message::text(format!("part-{sequence}")))
                    .with_correlation_group_size(3)
                    .with_correlation_sequence(sequence);
                reply_to.handler().process_reply_to(reply, None);
            }
        }
        Box::pin(async { Ok(None) })
    }
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_expired_group_reaches_exception_listener() {
    let listener = RecordingExceptionListener::new();
    let correlator = correlator()
        .with_timeout(Duration::from_millis(100))
        .with_fail_on_timeout(true)
        .with_exception_listener(Arc::new(listener.clone()));
    let id = CorrelationId::from("late");
    let events = group_events(&id, 3);
    correlator.add_event(events[0].clone()).unwrap();

    assert!(correlator.expire_groups().is_empty());
    assert!(listener.errors().is_empty());

    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(correlator.expire_groups().is_empty());

    let errors = listener.errors();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        MessagingError::CorrelationTimeout {
            correlation_id,
            received,
            expected,
            events,
        } => {
            assert_eq!(correlation_id, &id);
            assert_eq!(*received, 1);
            assert_eq!(*expected, Some(3));
            assert_eq!(events.len(), 1);
        },
        other => panic!("Expected a correlation timeout, got {other:?}"),
    }

    // Stragglers for the expired group are dropped
    assert!(correlator.add_event(events[1].clone()).unwrap().is_none());
    assert!(correlator.groups().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expired_group_aggregates_partially_when_not_failing() {
    let correlator = correlator()
        .with_timeout(Duration::from_millis(100))
        .with_fail_on_timeout(false);
    let id = CorrelationId::from("partial");
    let events = group_events(&id, 4);
    correlator.add_event(events[0].clone()).unwrap();
    correlator.add_event(events[3].clone()).unwrap();

    tokio::time::advance(Duration::from_millis(150)).await;
    let forwarded = correlator.expire_groups();

    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].message().payload().collection_len(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_expired_groups_land_in_dead_letter_queue() {
    let dlq = DeadLetterQueue::<Vec<Event>>::new(10);
    let correlator = correlator()
        .with_timeout(Duration::from_millis(10))
        .with_exception_listener(Arc::new(dlq.clone()));
    let events = group_events(&CorrelationId::from("lost"), 2);
    correlator.add_event(events[1].clone()).unwrap();

    tokio::time::advance(Duration::from_millis(20)).await;
    correlator.expire_groups();

    let letters = dlq.drain();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].payload.len(), 1);
    assert!(letters[0].reason.contains("lost"));
}
