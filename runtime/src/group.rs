//! Events collected under one correlation id.
//!
//! An [`EventGroup`] is created when the first event of a correlation id
//! arrives and lives until it is aggregated or expires. It is not thread-safe
//! by itself; the correlator keeps each group behind its own mutex so that
//! appends and the readiness check happen under the same lock.
//!
//! ```text
//! Collecting ──► Ready ──► Aggregated
//!      │
//!      └──────────────────────► Expired
//! ```
//!
//! `Aggregated` and `Expired` are terminal: a closed group rejects further
//! events, which keeps a redelivered reply from triggering a second
//! aggregation.

use correlator_core::{CorrelationId, Event, Message};
use smallvec::SmallVec;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Waiting for more events
    Collecting,
    /// The aggregation policy considers the group complete
    Ready,
    /// Aggregated and removed (terminal)
    Aggregated,
    /// Timed out before completion (terminal)
    Expired,
}

impl GroupState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Aggregated | Self::Expired)
    }
}

/// Result of adding an event to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The event joined the group
    Added,
    /// An event with the same id is already in the group
    Duplicate,
    /// The group is aggregated or expired
    Closed,
}

/// Correlated events awaiting aggregation.
#[derive(Debug)]
pub struct EventGroup {
    group_id: CorrelationId,
    expected_size: Option<usize>,
    events: SmallVec<[Event; 4]>,
    state: GroupState,
    created: Instant,
}

impl EventGroup {
    /// Create an empty group.
    ///
    /// `expected_size` of `None` means unknown; it is then taken from the
    /// group size carried by arriving events.
    #[must_use]
    pub fn new(group_id: CorrelationId, expected_size: Option<usize>) -> Self {
        Self {
            group_id,
            expected_size,
            events: SmallVec::new(),
            state: GroupState::Collecting,
            created: Instant::now(),
        }
    }

    /// Add an event exactly once.
    ///
    /// A group size carried by the event overrides the expected size, so the
    /// last-arriving event decides.
    pub fn add_event(&mut self, event: Event) -> AddOutcome {
        if self.state.is_terminal() {
            return AddOutcome::Closed;
        }
        if self.events.iter().any(|e| e.id() == event.id()) {
            return AddOutcome::Duplicate;
        }
        if let Some(size) = event.correlation_group_size() {
            self.expected_size = Some(size);
        }
        self.events.push(event);
        AddOutcome::Added
    }

    /// Group id.
    #[must_use]
    pub const fn group_id(&self) -> &CorrelationId {
        &self.group_id
    }

    /// Number of events held.
    #[must_use]
    pub fn size(&self) -> usize {
        self.events.len()
    }

    /// Whether the group holds no event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Expected number of events, if known.
    #[must_use]
    pub const fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    /// Events in arrival order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> GroupState {
        self.state
    }

    /// When the group was created.
    #[must_use]
    pub const fn created(&self) -> Instant {
        self.created
    }

    /// Time since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// `Collecting → Ready`. Returns `false` from any other state.
    pub fn mark_ready(&mut self) -> bool {
        if self.state == GroupState::Collecting {
            self.state = GroupState::Ready;
            true
        } else {
            false
        }
    }

    /// Move to `Aggregated`. Returns `false` if the group is already closed.
    pub fn mark_aggregated(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = GroupState::Aggregated;
        true
    }

    /// Move to `Expired`. Returns `false` if the group is already closed.
    pub fn mark_expired(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = GroupState::Expired;
        true
    }

    /// Remove and return all held events.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// The held messages as one collection message.
    ///
    /// Events are ordered by correlation sequence when every event carries
    /// one, otherwise by arrival.
    #[must_use]
    pub fn to_message_collection(&self) -> Message {
        Message::collection(
            self.ordered_events()
                .into_iter()
                .map(|e| e.message().clone())
                .collect(),
        )
    }

    /// Events ordered by sequence if all carry one, else in arrival order.
    #[must_use]
    pub fn ordered_events(&self) -> Vec<&Event> {
        let mut ordered: Vec<&Event> = self.events.iter().collect();
        if ordered.iter().all(|e| e.correlation_sequence().is_some()) {
            ordered.sort_by_key(|e| e.correlation_sequence());
        }
        ordered
    }
}

impl std::fmt::Display for EventGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EventGroup {{ id: {}, size: {}, expected: {:?}, state: {:?} }}",
            self.group_id,
            self.events.len(),
            self.expected_size,
            self.state
        )
    }
}
