//! Aggregation policies and strategies.
//!
//! An [`AggregationPolicy`] decides when an [`EventGroup`] is complete and
//! collapses it into one result event. Multi-reply aggregation delegates the
//! actual combination to an injectable [`AggregationStrategy`].
//!
//! # Example
//!
//! ```
//! use correlator_core::{CorrelationId, Event, Message};
//! use correlator_runtime::aggregator::{
//!     AggregationPolicy, ConcatenationStrategy, ResponseCorrelationAggregator,
//! };
//! use correlator_runtime::group::EventGroup;
//!
//! let policy = ResponseCorrelationAggregator::with_strategy(ConcatenationStrategy::new("+"));
//! let id = CorrelationId::from("quote");
//! let mut group = EventGroup::new(id.clone(), Some(2));
//!
//! group.add_event(Event::new(Message::text("a")).with_correlation_id(id.clone()));
//! assert!(!policy.should_aggregate(&group));
//!
//! group.add_event(Event::new(Message::text("b")).with_correlation_id(id));
//! assert!(policy.should_aggregate(&group));
//! assert_eq!(policy.aggregate(&group).unwrap().message_as_string(), "a+b");
//! ```

use crate::group::EventGroup;
use correlator_core::{CorrelationId, Event, Message};
use std::sync::Arc;
use thiserror::Error;

/// Aggregation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// There was nothing to aggregate
    #[error("Group '{0}' holds no events")]
    Empty(CorrelationId),

    /// The strategy rejected the group
    #[error("Strategy failed for group '{correlation_id}': {reason}")]
    Strategy {
        /// Group id
        correlation_id: CorrelationId,
        /// Why the strategy failed
        reason: String,
    },
}

/// Combines the messages of a complete group.
pub trait AggregationStrategy: Send + Sync {
    /// Combine `events` (ordered by sequence when available) into one message.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::Strategy`] if the events cannot be combined.
    fn combine(&self, group_id: &CorrelationId, events: &[&Event])
    -> Result<Message, AggregationError>;
}

/// Collects the messages into one collection payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStrategy;

impl AggregationStrategy for CollectionStrategy {
    fn combine(
        &self,
        _group_id: &CorrelationId,
        events: &[&Event],
    ) -> Result<Message, AggregationError> {
        Ok(Message::collection(
            events.iter().map(|e| e.message().clone()).collect(),
        ))
    }
}

/// Joins the string form of every message with a separator.
#[derive(Debug, Clone)]
pub struct ConcatenationStrategy {
    separator: String,
}

impl ConcatenationStrategy {
    /// Create a strategy joining with `separator`.
    #[must_use]
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl Default for ConcatenationStrategy {
    fn default() -> Self {
        Self::new("")
    }
}

impl AggregationStrategy for ConcatenationStrategy {
    fn combine(
        &self,
        _group_id: &CorrelationId,
        events: &[&Event],
    ) -> Result<Message, AggregationError> {
        let parts: Vec<String> = events.iter().map(|e| e.message_as_string()).collect();
        Ok(Message::text(parts.join(&self.separator)))
    }
}

/// Strategy backed by a closure.
pub struct FnStrategy<F> {
    f: F,
}

impl<F> FnStrategy<F>
where
    F: Fn(&CorrelationId, &[&Event]) -> Result<Message, AggregationError> + Send + Sync,
{
    /// Wrap a closure.
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> AggregationStrategy for FnStrategy<F>
where
    F: Fn(&CorrelationId, &[&Event]) -> Result<Message, AggregationError> + Send + Sync,
{
    fn combine(
        &self,
        group_id: &CorrelationId,
        events: &[&Event],
    ) -> Result<Message, AggregationError> {
        (self.f)(group_id, events)
    }
}

/// Readiness and aggregation capability of an event correlator.
pub trait AggregationPolicy: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Expected group size announced by an event.
    fn expected_size(&self, event: &Event) -> Option<usize> {
        event.correlation_group_size()
    }

    /// Whether `group` is complete.
    fn should_aggregate(&self, group: &EventGroup) -> bool;

    /// Collapse `group` into one result event.
    ///
    /// # Errors
    ///
    /// Returns an [`AggregationError`] when the group cannot be combined.
    fn aggregate(&self, group: &EventGroup) -> Result<Event, AggregationError>;
}

/// Policy for exactly one reply per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleResponseRouter;

impl SingleResponseRouter {
    /// Create the policy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AggregationPolicy for SingleResponseRouter {
    fn name(&self) -> &'static str {
        "single_response"
    }

    fn should_aggregate(&self, group: &EventGroup) -> bool {
        if let Some(expected) = group.expected_size().filter(|size| *size > 1) {
            tracing::warn!(
                correlation_id = %group.group_id(),
                expected,
                "Single response router got a correlation group size above one, using the first reply"
            );
        }
        !group.is_empty()
    }

    fn aggregate(&self, group: &EventGroup) -> Result<Event, AggregationError> {
        group
            .events()
            .first()
            .cloned()
            .ok_or_else(|| AggregationError::Empty(group.group_id().clone()))
    }
}

/// Policy for N replies per request, N taken from the correlation group size.
#[derive(Clone)]
pub struct ResponseCorrelationAggregator {
    strategy: Arc<dyn AggregationStrategy>,
}

impl ResponseCorrelationAggregator {
    /// Aggregate into a collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategy: Arc::new(CollectionStrategy),
        }
    }

    /// Aggregate with `strategy`.
    #[must_use]
    pub fn with_strategy(strategy: impl AggregationStrategy + 'static) -> Self {
        Self {
            strategy: Arc::new(strategy),
        }
    }

    /// Aggregate with a shared strategy.
    #[must_use]
    pub fn with_shared_strategy(strategy: Arc<dyn AggregationStrategy>) -> Self {
        Self { strategy }
    }
}

impl Default for ResponseCorrelationAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResponseCorrelationAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCorrelationAggregator")
            .finish_non_exhaustive()
    }
}

impl AggregationPolicy for ResponseCorrelationAggregator {
    fn name(&self) -> &'static str {
        "response_correlation"
    }

    fn should_aggregate(&self, group: &EventGroup) -> bool {
        match group.expected_size() {
            Some(expected) => group.size() >= expected,
            None => {
                // Fail open: an unknown size must not hang the group forever
                tracing::warn!(
                    correlation_id = %group.group_id(),
                    "Correlation group size is not set, aggregating on first event"
                );
                !group.is_empty()
            },
        }
    }

    fn aggregate(&self, group: &EventGroup) -> Result<Event, AggregationError> {
        let ordered = group.ordered_events();
        let first = ordered
            .first()
            .copied()
            .ok_or_else(|| AggregationError::Empty(group.group_id().clone()))?;
        let message = self.strategy.combine(group.group_id(), &ordered)?;
        Ok(first.derive(message))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn group_of(expected: Option<usize>, texts: &[&str]) -> EventGroup {
        let id = CorrelationId::from("g");
        let mut group = EventGroup::new(id.clone(), expected);
        for (sequence, text) in texts.iter().enumerate() {
            group.add_event(
                Event::new(Message::text(*text))
                    .with_correlation_id(id.clone())
                    .with_correlation_sequence(sequence),
            );
        }
        group
    }

    #[test]
    fn test_readiness_for_three_way_group() {
        let policy = ResponseCorrelationAggregator::new();
        assert!(!policy.should_aggregate(&group_of(Some(3), &["a"])));
        assert!(!policy.should_aggregate(&group_of(Some(3), &["a", "b"])));
        assert!(policy.should_aggregate(&group_of(Some(3), &["a", "b", "c"])));
    }

    #[test]
    fn test_unknown_size_aggregates_eagerly() {
        let policy = ResponseCorrelationAggregator::new();
        assert!(policy.should_aggregate(&group_of(None, &["a"])));
        assert!(!policy.should_aggregate(&group_of(None, &[])));
    }

    #[test]
    fn test_collection_contains_every_member() {
        let policy = ResponseCorrelationAggregator::new();
        let result = policy.aggregate(&group_of(Some(3), &["a", "b", "c"])).unwrap();
        assert_eq!(result.message().payload().collection_len(), Some(3));
        assert_eq!(result.message_as_string(), "[a,b,c]");
        assert_eq!(result.correlation_id(), Some(&CorrelationId::from("g")));
    }

    #[test]
    fn test_single_response_returns_first_event_unchanged() {
        let group = group_of(Some(4), &["only", "extra"]);
        let policy = SingleResponseRouter::new();

        assert!(policy.should_aggregate(&group));
        assert_eq!(policy.aggregate(&group).unwrap(), group.events()[0]);
    }

    #[test]
    fn test_fn_strategy_failure_surfaces() {
        let policy = ResponseCorrelationAggregator::with_strategy(FnStrategy::new(
            |id: &CorrelationId, _events: &[&Event]| {
                Err(AggregationError::Strategy {
                    correlation_id: id.clone(),
                    reason: "unsupported payload".to_string(),
                })
            },
        ));

        let result = policy.aggregate(&group_of(Some(1), &["a"]));
        assert!(matches!(result, Err(AggregationError::Strategy { .. })));
    }

    #[test]
    fn test_empty_group_cannot_aggregate() {
        let policy = SingleResponseRouter::new();
        assert_eq!(
            policy.aggregate(&group_of(None, &[])),
            Err(AggregationError::Empty(CorrelationId::from("g")))
        );
    }
}
