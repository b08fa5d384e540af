//! # Correlator Core
//!
//! Data model and collaborator contracts for the asynchronous request/reply
//! correlation kernel.
//!
//! ## Core Concepts
//!
//! - **Event**: immutable-per-hop unit of work carrying a [`Message`] and
//!   correlation metadata
//! - **Message**: payload plus typed, scoped properties
//! - **Processor**: anything that accepts events (components, transports,
//!   the requester itself)
//! - **`ReplyToHandler`**: callback an asynchronous destination uses to answer
//! - **`MessagingError`**: the failures a caller can observe
//!
//! The runtime crate builds the requester, event correlator, retry templates
//! and transactional queues on top of these types.
//!
//! [`Message`]: message::Message

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod error;
pub mod event;
pub mod message;
pub mod processor;
pub mod reply;

pub use error::MessagingError;
pub use event::{CorrelationId, Event, EventId, ExchangePattern, FlowIdentity, ReplyTo};
pub use message::{Message, Payload, Properties, PropertyScope, PropertyValue};
pub use processor::{
    ExceptionListener, ExceptionOutcome, FnProcessor, MessageSource, MessagingExceptionHandler,
    ProcessResult, Processor,
};
pub use reply::ReplyToHandler;
