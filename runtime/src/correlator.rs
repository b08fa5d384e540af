//! Event correlator: routes events into groups and aggregates complete ones.
//!
//! # Concurrency
//!
//! Groups live in a sharded map, each behind its own mutex. An event is added
//! and the readiness check is made under the group's lock, so aggregation
//! happens after every contributing append and at most once. The lock order
//! is always group, then map shard; nothing takes a group lock while holding
//! a shard.
//!
//! Once aggregated (or expired, or discarded) a group id is remembered in a
//! bounded FIFO of processed ids. Events that arrive later for such a group
//! are dropped as missed replies instead of opening a fresh group.

use crate::aggregator::{AggregationError, AggregationPolicy};
use crate::config::{CorrelatorConfig, MAX_PROCESSED_GROUPS};
use crate::context::RuntimeContext;
use crate::group::{AddOutcome, EventGroup};
use crate::metrics::AggregationMetrics;
use correlator_core::{CorrelationId, Event, ExceptionListener, MessagingError, Processor};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

type SharedGroup = Arc<Mutex<EventGroup>>;

fn lock(group: &SharedGroup) -> MutexGuard<'_, EventGroup> {
    group.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded memory of processed group ids, oldest forgotten first.
#[derive(Debug)]
struct ProcessedGroups {
    order: VecDeque<CorrelationId>,
    members: HashSet<CorrelationId>,
    capacity: usize,
}

impl ProcessedGroups {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: CorrelationId) {
        if !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &CorrelationId) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|member| member != id);
        true
    }
}

/// Concurrent registry of open event groups.
#[derive(Debug)]
pub struct GroupRegistry {
    groups: DashMap<CorrelationId, SharedGroup>,
    processed: Mutex<ProcessedGroups>,
}

impl GroupRegistry {
    /// Create a registry remembering up to `max_processed` processed ids.
    #[must_use]
    pub fn new(max_processed: usize) -> Self {
        Self {
            groups: DashMap::new(),
            processed: Mutex::new(ProcessedGroups::new(max_processed)),
        }
    }

    /// The group for `id`, created with `expected_size` if absent.
    pub fn get_or_create(&self, id: &CorrelationId, expected_size: Option<usize>) -> SharedGroup {
        let group = self
            .groups
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(EventGroup::new(id.clone(), expected_size))))
            .clone();
        AggregationMetrics::record_open_groups(self.groups.len());
        group
    }

    /// The group for `id`, if open.
    #[must_use]
    pub fn get(&self, id: &CorrelationId) -> Option<SharedGroup> {
        self.groups.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the group for `id`. Idempotent.
    pub fn remove(&self, id: &CorrelationId) -> Option<SharedGroup> {
        let removed = self.groups.remove(id).map(|(_, group)| group);
        AggregationMetrics::record_open_groups(self.groups.len());
        removed
    }

    /// Remember `id` as processed.
    pub fn mark_processed(&self, id: &CorrelationId) {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
    }

    /// Whether `id` was processed recently.
    #[must_use]
    pub fn is_processed(&self, id: &CorrelationId) -> bool {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .contains(id)
    }

    /// Forget that `id` was processed, so a new request may reuse it.
    pub fn forget_processed(&self, id: &CorrelationId) -> bool {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Snapshot of all open groups.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SharedGroup> {
        self.groups.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of open groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no group is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Close `group` (already locked), drop it from the map and remember it.
    fn close(&self, group: &mut EventGroup) {
        let id = group.group_id().clone();
        self.mark_processed(&id);
        self.remove(&id);
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new(MAX_PROCESSED_GROUPS)
    }
}

/// Routes events into groups and applies an aggregation policy.
pub struct EventCorrelator {
    policy: Arc<dyn AggregationPolicy>,
    groups: Arc<GroupRegistry>,
    exception_listener: Option<Arc<dyn ExceptionListener>>,
    timeout: Option<Duration>,
    fail_on_timeout: bool,
    monitor_interval: Duration,
}

impl EventCorrelator {
    /// Create a correlator over `groups`, with default expiry settings.
    #[must_use]
    pub fn new(policy: Arc<dyn AggregationPolicy>, groups: Arc<GroupRegistry>) -> Self {
        Self::with_config(policy, groups, &CorrelatorConfig::default())
    }

    /// Create a correlator with explicit expiry settings.
    #[must_use]
    pub fn with_config(
        policy: Arc<dyn AggregationPolicy>,
        groups: Arc<GroupRegistry>,
        config: &CorrelatorConfig,
    ) -> Self {
        Self {
            policy,
            groups,
            exception_listener: None,
            timeout: config.timeout(),
            fail_on_timeout: config.fail_on_timeout,
            monitor_interval: config.monitor_interval(),
        }
    }

    /// Report failed and expired groups to `listener`.
    #[must_use]
    pub fn with_exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.exception_listener = Some(listener);
        self
    }

    /// Expire groups older than `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Report expired groups (true) or aggregate them partially (false).
    #[must_use]
    pub const fn with_fail_on_timeout(mut self, fail_on_timeout: bool) -> Self {
        self.fail_on_timeout = fail_on_timeout;
        self
    }

    /// The aggregation policy.
    #[must_use]
    pub fn policy(&self) -> &Arc<dyn AggregationPolicy> {
        &self.policy
    }

    /// The group registry.
    #[must_use]
    pub const fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// Add an event to its group and aggregate the group if it is complete.
    ///
    /// Returns `Ok(None)` while the group is still collecting, and also when
    /// the event is dropped as a duplicate or as a missed reply for an
    /// already processed group.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::NoCorrelationId`] if the event carries no id
    /// - [`MessagingError::AggregationFailed`] if the policy fails; the whole
    ///   group is removed and handed to the exception listener
    pub fn add_event(&self, event: Event) -> Result<Option<Event>, MessagingError> {
        self.add_event_then(event, |aggregated| aggregated)?.transpose()
    }

    /// Like [`add_event`](Self::add_event), but hands the aggregation result
    /// to `complete` while the group is still locked.
    ///
    /// The group is closed only after `complete` returns, so whoever settles
    /// the same group concurrently through [`settle`](Self::settle) observes
    /// either the open group or the delivered result, never a gap between.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NoCorrelationId`] if the event carries no id.
    pub fn add_event_then<R>(
        &self,
        event: Event,
        complete: impl FnOnce(Result<Event, MessagingError>) -> R,
    ) -> Result<Option<R>, MessagingError> {
        let Some(id) = event.correlation_id().cloned() else {
            return Err(MessagingError::NoCorrelationId {
                event_id: event.id().to_string(),
            });
        };

        loop {
            if self.groups.is_processed(&id) {
                tracing::debug!(
                    correlation_id = %id,
                    event_id = %event.id(),
                    "Missed async reply for an already processed group, dropping event"
                );
                AggregationMetrics::record_missed_reply();
                return Ok(None);
            }

            let shared = self
                .groups
                .get_or_create(&id, self.policy.expected_size(&event));
            let mut group = lock(&shared);

            // Created just after the previous group for this id was closed
            if group.is_empty() && self.groups.is_processed(&id) {
                if group.mark_expired() {
                    self.groups.remove(&id);
                }
                continue;
            }

            match group.add_event(event.clone()) {
                // Removed concurrently; look the id up again
                AddOutcome::Closed => continue,
                AddOutcome::Duplicate => {
                    tracing::debug!(
                        correlation_id = %id,
                        event_id = %event.id(),
                        "Event already in group, ignoring redelivery"
                    );
                    return Ok(None);
                },
                AddOutcome::Added => {},
            }

            if !self.policy.should_aggregate(&group) {
                return Ok(None);
            }
            group.mark_ready();
            let settled = complete(self.aggregate_locked(&mut group));
            self.groups.close(&mut group);
            return Ok(Some(settled));
        }
    }

    /// Aggregate whatever the group for `id` holds, complete or not.
    ///
    /// Returns `Ok(None)` if no open group exists or it is empty.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::AggregationFailed`] if the policy fails.
    pub fn force_aggregate(&self, id: &CorrelationId) -> Result<Option<Event>, MessagingError> {
        let Some(shared) = self.groups.get(id) else {
            return Ok(None);
        };
        let mut group = lock(&shared);
        if group.state().is_terminal() {
            return Ok(None);
        }
        if group.is_empty() {
            group.mark_expired();
            self.groups.close(&mut group);
            return Ok(None);
        }
        let result = self.aggregate_locked(&mut group);
        self.groups.close(&mut group);
        result.map(Some)
    }

    /// Close the group for `id` on behalf of a waiter that gave up, handing
    /// `complete` the partial aggregation.
    ///
    /// `complete` receives `None` when the group already finished (its result
    /// went to [`add_event_then`](Self::add_event_then)'s callback) or holds
    /// no events. Either way the id is remembered as processed afterwards, so
    /// replies still in flight are dropped as missed replies.
    pub fn settle<R>(
        &self,
        id: &CorrelationId,
        complete: impl FnOnce(Option<Result<Event, MessagingError>>) -> R,
    ) -> R {
        let shared = self.groups.get_or_create(id, None);
        let mut group = lock(&shared);
        if group.state().is_terminal() {
            return complete(None);
        }
        let settled = if group.is_empty() {
            group.mark_expired();
            complete(None)
        } else {
            complete(Some(self.aggregate_locked(&mut group)))
        };
        self.groups.close(&mut group);
        settled
    }

    /// Remove the group for `id` without aggregating; returns its events.
    pub fn discard(&self, id: &CorrelationId) -> Option<Vec<Event>> {
        let shared = self.groups.get(id)?;
        let mut group = lock(&shared);
        if !group.mark_expired() {
            return None;
        }
        self.groups.close(&mut group);
        Some(group.take_events())
    }

    /// Expire every group older than the correlator timeout.
    ///
    /// With `fail_on_timeout` the buffered events go to the exception listener
    /// as a [`MessagingError::CorrelationTimeout`]; otherwise each expired
    /// group is aggregated partially and the results are returned for
    /// forwarding.
    pub fn expire_groups(&self) -> Vec<Event> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };

        let mut forwarded = Vec::new();
        for shared in self.groups.snapshot() {
            let mut group = lock(&shared);
            if group.state().is_terminal() || group.age() < timeout {
                continue;
            }

            if self.fail_on_timeout || group.is_empty() {
                let id = group.group_id().clone();
                let expected = group.expected_size();
                group.mark_expired();
                self.groups.close(&mut group);
                let events = group.take_events();
                AggregationMetrics::record_expired();
                tracing::warn!(
                    correlation_id = %id,
                    received = events.len(),
                    expected = ?expected,
                    "Correlation group timed out"
                );
                self.notify(&MessagingError::CorrelationTimeout {
                    correlation_id: id,
                    received: events.len(),
                    expected,
                    events,
                });
            } else {
                tracing::info!(
                    correlation_id = %group.group_id(),
                    received = group.size(),
                    "Correlation group timed out, forwarding partial aggregation"
                );
                let result = self.aggregate_locked(&mut group);
                self.groups.close(&mut group);
                // Failures were already reported to the listener
                if let Ok(event) = result {
                    forwarded.push(event);
                }
            }
        }
        forwarded
    }

    /// Run [`expire_groups`](Self::expire_groups) periodically until the
    /// context shuts down, handing partial aggregations to `forward`.
    pub fn spawn_timeout_monitor(
        self: &Arc<Self>,
        context: &RuntimeContext,
        forward: Arc<dyn Processor>,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        let mut shutdown = context.shutdown_signal();
        let interval = self.monitor_interval;

        context.handle().spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                for event in correlator.expire_groups() {
                    if let Err(error) = forward.process(event).await {
                        tracing::error!(%error, "Failed to forward partially aggregated group");
                    }
                }
            }
            tracing::debug!("Group timeout monitor stopped");
        })
    }

    // Leaves the group in the map; the caller closes it once the result is delivered
    fn aggregate_locked(&self, group: &mut EventGroup) -> Result<Event, MessagingError> {
        let result = self.policy.aggregate(group);
        group.mark_aggregated();

        match result {
            Ok(event) => {
                AggregationMetrics::record_completed(self.policy.name());
                tracing::debug!(
                    correlation_id = %group.group_id(),
                    size = group.size(),
                    policy = self.policy.name(),
                    "Aggregated correlation group"
                );
                group.take_events();
                Ok(event)
            },
            Err(err) => {
                AggregationMetrics::record_failed();
                let error = aggregation_failed(group, &err);
                tracing::error!(correlation_id = %group.group_id(), error = %err, "Aggregation failed");
                self.notify(&error);
                Err(error)
            },
        }
    }

    fn notify(&self, error: &MessagingError) {
        if let Some(listener) = &self.exception_listener {
            listener.exception_thrown(error);
        }
    }
}

fn aggregation_failed(group: &mut EventGroup, err: &AggregationError) -> MessagingError {
    MessagingError::AggregationFailed {
        correlation_id: group.group_id().clone(),
        reason: err.to_string(),
        events: group.take_events(),
    }
}

impl std::fmt::Debug for EventCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCorrelator")
            .field("policy", &self.policy.name())
            .field("open_groups", &self.groups.len())
            .field("timeout", &self.timeout)
            .field("fail_on_timeout", &self.fail_on_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregator::{
        AggregationError, FnStrategy, ResponseCorrelationAggregator, SingleResponseRouter,
    };
    use correlator_core::Message;

    #[derive(Default)]
    struct Collect(Mutex<Vec<MessagingError>>);

    impl ExceptionListener for Collect {
        fn exception_thrown(&self, error: &MessagingError) {
            self.0.lock().unwrap().push(error.clone());
        }
    }

    fn reply(id: &str, size: usize, text: &str) -> Event {
        Event::new(Message::text(text))
            .with_correlation_id(CorrelationId::from(id))
            .with_correlation_group_size(size)
    }

    fn correlator(policy: Arc<dyn AggregationPolicy>) -> EventCorrelator {
        EventCorrelator::new(policy, Arc::new(GroupRegistry::default()))
    }

    #[test]
    fn test_aggregates_exactly_once_when_complete() {
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()));

        assert_eq!(correlator.add_event(reply("g", 2, "a")).unwrap(), None);
        let result = correlator.add_event(reply("g", 2, "b")).unwrap().unwrap();

        assert_eq!(result.message_as_string(), "[a,b]");
        assert!(correlator.groups().is_empty());
        // Late third reply is a missed reply, not a new group
        assert_eq!(correlator.add_event(reply("g", 2, "c")).unwrap(), None);
        assert!(correlator.groups().is_empty());
    }

    #[test]
    fn test_missing_correlation_id_is_rejected() {
        let correlator = correlator(Arc::new(SingleResponseRouter::new()));
        let result = correlator.add_event(Event::new(Message::text("orphan")));
        assert!(matches!(result, Err(MessagingError::NoCorrelationId { .. })));
    }

    #[test]
    fn test_aggregation_failure_hands_whole_group_to_listener() {
        let listener = Arc::new(Collect::default());
        let policy = ResponseCorrelationAggregator::with_strategy(FnStrategy::new(
            |id: &CorrelationId, _: &[&Event]| {
                Err(AggregationError::Strategy {
                    correlation_id: id.clone(),
                    reason: "bad".to_string(),
                })
            },
        ));
        let correlator = correlator(Arc::new(policy)).with_exception_listener(listener.clone());

        correlator.add_event(reply("g", 2, "a")).unwrap();
        let result = correlator.add_event(reply("g", 2, "b"));

        assert!(matches!(result, Err(MessagingError::AggregationFailed { .. })));
        let reported = listener.0.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].group_events().len(), 2);
        assert!(correlator.groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_group_reported_when_failing_on_timeout() {
        let listener = Arc::new(Collect::default());
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()))
            .with_timeout(Duration::from_millis(50))
            .with_exception_listener(listener.clone());

        correlator.add_event(reply("g", 3, "a")).unwrap();
        assert!(correlator.expire_groups().is_empty());
        assert_eq!(correlator.groups().len(), 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(correlator.expire_groups().is_empty());

        assert!(correlator.groups().is_empty());
        let reported = listener.0.lock().unwrap();
        assert!(matches!(
            reported[0],
            MessagingError::CorrelationTimeout { received: 1, expected: Some(3), .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_group_forwarded_partially() {
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()))
            .with_timeout(Duration::from_millis(50))
            .with_fail_on_timeout(false);

        correlator.add_event(reply("g", 3, "a")).unwrap();
        correlator.add_event(reply("g", 3, "b")).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;

        let forwarded = correlator.expire_groups();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].message_as_string(), "[a,b]");
    }

    #[test]
    fn test_force_aggregate_and_discard() {
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()));
        correlator.add_event(reply("partial", 5, "a")).unwrap();
        correlator.add_event(reply("dropped", 5, "x")).unwrap();

        let partial = correlator
            .force_aggregate(&CorrelationId::from("partial"))
            .unwrap()
            .unwrap();
        assert_eq!(partial.message_as_string(), "[a]");

        let discarded = correlator.discard(&CorrelationId::from("dropped")).unwrap();
        assert_eq!(discarded.len(), 1);
        assert!(correlator.discard(&CorrelationId::from("dropped")).is_none());
        assert!(correlator.groups().is_processed(&CorrelationId::from("dropped")));
    }

    #[test]
    fn test_settle_hands_partial_group_to_waiter() {
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()));
        let id = CorrelationId::from("slow");
        correlator.add_event(reply("slow", 3, "a")).unwrap();

        let partial = correlator.settle(&id, |partial| partial.map(Result::unwrap));
        assert_eq!(partial.unwrap().message_as_string(), "[a]");

        // Stragglers neither reopen the group nor settle twice
        assert_eq!(correlator.add_event(reply("slow", 3, "b")).unwrap(), None);
        assert!(correlator.groups().is_empty());
        assert!(correlator.settle(&id, |partial| partial.is_none()));
    }

    #[test]
    fn test_settle_after_completion_sees_nothing() {
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()));
        let id = CorrelationId::from("done");

        let delivered = correlator
            .add_event_then(reply("done", 1, "a"), |aggregated| {
                aggregated.unwrap().message_as_string()
            })
            .unwrap();
        assert_eq!(delivered.as_deref(), Some("[a]"));

        assert!(correlator.settle(&id, |partial| partial.is_none()));
        assert!(correlator.groups().is_empty());
    }

    #[test]
    fn test_settle_without_group_drops_later_replies() {
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()));
        let id = CorrelationId::from("silent");

        assert!(correlator.settle(&id, |partial| partial.is_none()));
        assert!(correlator.groups().is_processed(&id));
        assert_eq!(correlator.add_event(reply("silent", 1, "late")).unwrap(), None);
        assert!(correlator.groups().is_empty());
    }

    #[test]
    fn test_concurrent_replies_aggregate_exactly_once() {
        const REPLIES: usize = 8;
        let correlator = correlator(Arc::new(ResponseCorrelationAggregator::new()));

        let results: Vec<Option<Event>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..REPLIES)
                .map(|n| {
                    let correlator = &correlator;
                    scope.spawn(move || {
                        correlator.add_event(reply("burst", REPLIES, &n.to_string())).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let aggregated: Vec<_> = results.into_iter().flatten().collect();
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].message_as_string().matches(',').count(), 7);
        assert!(correlator.groups().is_empty());

        // A reply racing in after closure is dropped rather than reopening the group
        assert_eq!(correlator.add_event(reply("burst", REPLIES, "late")).unwrap(), None);
        assert!(correlator.groups().is_empty());
    }

    #[test]
    fn test_processed_ids_are_bounded() {
        let registry = GroupRegistry::new(2);
        for id in ["a", "b", "c"] {
            registry.mark_processed(&CorrelationId::from(id));
        }
        assert!(!registry.is_processed(&CorrelationId::from("a")));
        assert!(registry.is_processed(&CorrelationId::from("c")));
    }
}
