//! Error taxonomy for messaging operations.
//!
//! Callers of a request/response exchange either get a result event or one of
//! these errors from the same call. Component-internal races (late replies,
//! duplicate replies, already-aggregated groups) never surface here; they are
//! discarded and logged where they happen.

use crate::event::{CorrelationId, Event};
use std::time::Duration;
use thiserror::Error;

/// Errors produced while dispatching, correlating or aggregating events.
#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    /// No reply arrived within the configured window
    #[error("No response received for correlation id '{correlation_id}' within {timeout:?}")]
    ResponseTimeout {
        /// Correlation id of the request that timed out
        correlation_id: CorrelationId,
        /// The window that elapsed
        timeout: Duration,
        /// The original request event
        event: Box<Event>,
    },

    /// The wait was cancelled before a reply or timeout
    #[error("Wait for correlation id '{correlation_id}' was cancelled")]
    Cancelled {
        /// Correlation id of the cancelled request
        correlation_id: CorrelationId,
    },

    /// A downstream processor failed
    #[error("Messaging failure: {message}")]
    Messaging {
        /// Description of the failure
        message: String,
        /// Event associated with the failure
        event: Option<Box<Event>>,
        /// Whether an exception strategy recovered from the failure
        handled: bool,
    },

    /// An event that must be correlated carries no correlation id
    #[error("Event {event_id} has no correlation id")]
    NoCorrelationId {
        /// Id of the offending event
        event_id: String,
    },

    /// A request with the same correlation id is already in flight
    #[error("Correlation id '{0}' is already registered")]
    DuplicateCorrelation(CorrelationId),

    /// An event group expired before it was complete
    #[error("Correlation group '{correlation_id}' timed out with {received} of {expected:?} events")]
    CorrelationTimeout {
        /// Group id
        correlation_id: CorrelationId,
        /// Events received before expiry
        received: usize,
        /// Expected size, if it was known
        expected: Option<usize>,
        /// The buffered events, handed over as a unit
        events: Vec<Event>,
    },

    /// Combining a group's events failed
    #[error("Aggregation of group '{correlation_id}' failed: {reason}")]
    AggregationFailed {
        /// Group id
        correlation_id: CorrelationId,
        /// Why aggregation failed
        reason: String,
        /// The buffered events, handed over as a unit
        events: Vec<Event>,
    },

    /// Handing an event to a downstream processor failed
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

impl MessagingError {
    /// Create an unhandled messaging failure.
    #[must_use]
    pub fn messaging(message: impl Into<String>) -> Self {
        Self::Messaging {
            message: message.into(),
            event: None,
            handled: false,
        }
    }

    /// The event associated with this error, if any.
    #[must_use]
    pub fn event(&self) -> Option<&Event> {
        match self {
            Self::ResponseTimeout { event, .. } => Some(event),
            Self::Messaging { event, .. } => event.as_deref(),
            _ => None,
        }
    }

    /// Re-associate this error with `event`.
    ///
    /// Only variants that carry an event are changed.
    #[must_use]
    pub fn with_event(self, event: Event) -> Self {
        match self {
            Self::ResponseTimeout {
                correlation_id,
                timeout,
                ..
            } => Self::ResponseTimeout {
                correlation_id,
                timeout,
                event: Box::new(event),
            },
            Self::Messaging {
                message, handled, ..
            } => Self::Messaging {
                message,
                event: Some(Box::new(event)),
                handled,
            },
            other => other,
        }
    }

    /// Return a copy with the handled flag set.
    #[must_use]
    pub fn mark_handled(self) -> Self {
        match self {
            Self::Messaging { message, event, .. } => Self::Messaging {
                message,
                event,
                handled: true,
            },
            other => other,
        }
    }

    /// Whether an exception strategy already recovered from this failure.
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        matches!(self, Self::Messaging { handled: true, .. })
    }

    /// Whether this is a response timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. })
    }

    /// Events buffered in a failed group, if any.
    #[must_use]
    pub fn group_events(&self) -> &[Event] {
        match self {
            Self::CorrelationTimeout { events, .. } | Self::AggregationFailed { events, .. } => {
                events
            },
            _ => &[],
        }
    }
}
