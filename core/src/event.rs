//! The unit of work that flows through the correlation kernel.
//!
//! An [`Event`] is immutable per hop. It carries a shared [`Message`], the
//! correlation metadata that ties a reply back to its request, and an
//! optional [`ReplyTo`] handle the downstream uses to answer asynchronously.
//!
//! # Design
//!
//! Events are cheap to clone: the message sits behind an `Arc` and every
//! `with_*` builder returns a new event. When an event crosses a router or an
//! asynchronous boundary the sender keeps its copy and the receiver gets its
//! own, so concurrent branches never share mutable state.
//!
//! # Example
//!
//! ```
//! use correlator_core::event::{CorrelationId, Event, ExchangePattern};
//! use correlator_core::message::Message;
//!
//! let request = Event::new(Message::text("ping"))
//!     .with_exchange_pattern(ExchangePattern::RequestResponse)
//!     .with_correlation_id(CorrelationId::from("order-7"))
//!     .with_correlation_group_size(3);
//!
//! assert_eq!(request.correlation_id().map(CorrelationId::as_str), Some("order-7"));
//! assert_eq!(request.correlation_group_size(), Some(3));
//! assert!(request.exchange_pattern().is_request_response());
//! ```

use crate::message::Message;
use crate::reply::ReplyToHandler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Identifier shared by every event of one logical request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identity of a single event instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild an event id from its UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the caller waits for a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExchangePattern {
    /// Fire and forget
    #[default]
    OneWay,
    /// The caller waits for a result
    RequestResponse,
}

impl ExchangePattern {
    /// Check if this is the request/response pattern
    #[must_use]
    pub const fn is_request_response(self) -> bool {
        matches!(self, Self::RequestResponse)
    }
}

/// Component and endpoint an event belongs to.
///
/// This is the identity a persisted event needs to find its execution context
/// again after a reload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowIdentity {
    /// Name of the component (service or flow) processing the event
    pub component: String,
    /// Name of the endpoint the event entered through
    pub endpoint: String,
}

impl FlowIdentity {
    /// Create a flow identity.
    #[must_use]
    pub fn new(component: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Shared handle to the party waiting for an asynchronous reply.
#[derive(Clone)]
pub struct ReplyTo(Arc<dyn ReplyToHandler>);

impl ReplyTo {
    /// Wrap a reply handler.
    #[must_use]
    pub fn new(handler: Arc<dyn ReplyToHandler>) -> Self {
        Self(handler)
    }

    /// The wrapped handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn ReplyToHandler> {
        &self.0
    }
}

impl fmt::Debug for ReplyTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplyTo(<handler>)")
    }
}

/// An immutable-per-hop unit of work.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    message: Arc<Message>,
    correlation_id: Option<CorrelationId>,
    correlation_group_size: Option<usize>,
    correlation_sequence: Option<usize>,
    exchange_pattern: ExchangePattern,
    timeout: Option<Duration>,
    session_id: String,
    flow: Option<FlowIdentity>,
    reply_to: Option<ReplyTo>,
    created_at: DateTime<Utc>,
}

impl Event {
    /// Create a one-way event with a fresh id and session.
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            id: EventId::generate(),
            message: Arc::new(message),
            correlation_id: None,
            correlation_group_size: None,
            correlation_sequence: None,
            exchange_pattern: ExchangePattern::OneWay,
            timeout: None,
            session_id: Uuid::new_v4().to_string(),
            flow: None,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    /// Rebuild an event with a known id, e.g. when restoring from a queue.
    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    /// Derive a new event (fresh id) that keeps this event's correlation,
    /// session and flow identity but carries `message`.
    ///
    /// This is how replies and aggregation results are produced.
    #[must_use]
    pub fn derive(&self, message: Message) -> Self {
        Self {
            id: EventId::generate(),
            message: Arc::new(message),
            correlation_id: self.correlation_id.clone(),
            correlation_group_size: self.correlation_group_size,
            correlation_sequence: self.correlation_sequence,
            exchange_pattern: self.exchange_pattern,
            timeout: self.timeout,
            session_id: self.session_id.clone(),
            flow: self.flow.clone(),
            reply_to: self.reply_to.clone(),
            created_at: Utc::now(),
        }
    }

    /// The event id.
    #[must_use]
    pub const fn id(&self) -> EventId {
        self.id
    }

    /// The message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Render the message payload as a string.
    #[must_use]
    pub fn message_as_string(&self) -> String {
        self.message.as_string()
    }

    /// Correlation id, if any.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Number of events expected in this event's correlation group.
    #[must_use]
    pub const fn correlation_group_size(&self) -> Option<usize> {
        self.correlation_group_size
    }

    /// Position of this event within its correlation group.
    #[must_use]
    pub const fn correlation_sequence(&self) -> Option<usize> {
        self.correlation_sequence
    }

    /// Exchange pattern.
    #[must_use]
    pub const fn exchange_pattern(&self) -> ExchangePattern {
        self.exchange_pattern
    }

    /// Event-level timeout override.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Flow identity, if any.
    #[must_use]
    pub const fn flow(&self) -> Option<&FlowIdentity> {
        self.flow.as_ref()
    }

    /// Reply-to handle, if any.
    #[must_use]
    pub const fn reply_to(&self) -> Option<&ReplyTo> {
        self.reply_to.as_ref()
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copy with a different message.
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Arc::new(message);
        self
    }

    /// Copy with a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Copy with a correlation group size.
    #[must_use]
    pub fn with_correlation_group_size(mut self, size: usize) -> Self {
        self.correlation_group_size = Some(size);
        self
    }

    /// Copy with a correlation sequence number.
    #[must_use]
    pub fn with_correlation_sequence(mut self, sequence: usize) -> Self {
        self.correlation_sequence = Some(sequence);
        self
    }

    /// Copy with a different exchange pattern.
    #[must_use]
    pub fn with_exchange_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.exchange_pattern = pattern;
        self
    }

    /// Copy with an event-level timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy with a session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Copy with a flow identity.
    #[must_use]
    pub fn with_flow(mut self, flow: FlowIdentity) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Copy with a reply-to handle.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: ReplyTo) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Copy without a reply-to handle.
    #[must_use]
    pub fn without_reply_to(mut self) -> Self {
        self.reply_to = None;
        self
    }
}

/// Events compare by identity and content; the reply-to handle is ignored.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.message == other.message
            && self.correlation_id == other.correlation_id
            && self.correlation_group_size == other.correlation_group_size
            && self.correlation_sequence == other.correlation_sequence
            && self.exchange_pattern == other.exchange_pattern
            && self.session_id == other.session_id
            && self.flow == other.flow
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event {{ id: {}", self.id)?;
        if let Some(cid) = &self.correlation_id {
            write!(f, ", correlation_id: {cid}")?;
        }
        write!(f, ", pattern: {:?} }}", self.exchange_pattern)
    }
}
