//! Reply callback contract.
//!
//! A [`ReplyToHandler`] is attached to an outgoing event by whoever waits for
//! its answer. The asynchronous downstream calls it, possibly from another
//! task, when a reply or a failure becomes available.

use crate::error::MessagingError;
use crate::event::Event;
use crate::message::Message;

/// Callback invoked by an asynchronous destination with its outcome.
///
/// Implementations must never panic or block for long: they run on the
/// transport's task. A reply that nobody waits for any more is discarded.
pub trait ReplyToHandler: Send + Sync {
    /// Deliver a reply event.
    ///
    /// `original` is the request message as the downstream received it, when
    /// available.
    fn process_reply_to(&self, reply: Event, original: Option<Message>);

    /// Deliver a failure instead of a reply.
    fn process_exception_reply_to(&self, error: MessagingError);
}
