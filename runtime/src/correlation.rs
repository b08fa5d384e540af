//! Registry of requests waiting for an asynchronous reply.
//!
//! Each in-flight request owns one single-slot channel keyed by its
//! correlation id. Whoever removes the entry from the registry is the only
//! party allowed to signal it, so a reply is delivered at most once and a
//! reply that races a timeout either wins cleanly or is discarded.
//!
//! # Example
//!
//! ```
//! use correlator_core::{CorrelationId, Event, Message};
//! use correlator_runtime::correlation::{CorrelationRegistry, WaitOutcome};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let registry = Arc::new(CorrelationRegistry::new());
//! let id = CorrelationId::from("c-1");
//! let request = Event::new(Message::text("ping")).with_correlation_id(id.clone());
//!
//! let pending = registry.register(id.clone(), request.clone()).unwrap();
//! assert!(registry.resolve(&id, Ok(request.derive(Message::text("pong")))));
//!
//! match pending.wait(Some(Duration::from_secs(1))).await {
//!     WaitOutcome::Reply(Ok(reply)) => assert_eq!(reply.message_as_string(), "pong"),
//!     other => panic!("unexpected {other:?}"),
//! }
//! assert!(registry.is_empty());
//! # });
//! ```

use crate::metrics::CorrelationMetrics;
use correlator_core::{CorrelationId, Event, MessagingError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What ended a wait.
#[derive(Debug)]
pub enum WaitOutcome {
    /// A reply event or a delivered failure
    Reply(Result<Event, MessagingError>),
    /// The timeout elapsed first
    TimedOut,
    /// The wait was cancelled, e.g. on shutdown
    Cancelled,
}

enum Signal {
    Reply(Result<Event, MessagingError>),
    Cancelled,
}

impl From<Signal> for WaitOutcome {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Reply(result) => Self::Reply(result),
            Signal::Cancelled => Self::Cancelled,
        }
    }
}

struct PendingEntry {
    sender: oneshot::Sender<Signal>,
    request: Event,
}

/// Concurrent map of correlation id to waiting request.
///
/// Sharded, so unrelated correlation ids never contend on one lock. Removal is
/// idempotent.
#[derive(Default)]
pub struct CorrelationRegistry {
    entries: DashMap<CorrelationId, PendingEntry>,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before it is dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::DuplicateCorrelation`] when a request with the
    /// same id is already waiting.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        request: Event,
    ) -> Result<PendingReply, MessagingError> {
        let receiver = match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => return Err(MessagingError::DuplicateCorrelation(id)),
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingEntry { sender, request });
                receiver
            },
        };
        CorrelationMetrics::record_registered(self.entries.len());
        tracing::trace!(correlation_id = %id, "Registered pending request");

        Ok(PendingReply {
            id,
            receiver,
            registry: Arc::clone(self),
            registered_at: Instant::now(),
            finished: false,
        })
    }

    /// Deliver `outcome` to the request waiting under `id`.
    ///
    /// Returns `false` when nobody waits any more (late or duplicate reply);
    /// the outcome is then discarded.
    pub fn resolve(&self, id: &CorrelationId, outcome: Result<Event, MessagingError>) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            tracing::debug!(
                correlation_id = %id,
                "No pending request for reply, discarding late or duplicate reply"
            );
            CorrelationMetrics::record_discarded();
            return false;
        };
        CorrelationMetrics::record_resolved(self.entries.len());
        // The receiver may already be gone if the caller's future was dropped
        entry.sender.send(Signal::Reply(outcome)).is_ok()
    }

    /// Remove the entry for `id` without signalling it.
    pub fn deregister(&self, id: &CorrelationId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Release the request waiting under `id` with a cancelled outcome.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        CorrelationMetrics::record_cancelled();
        tracing::debug!(correlation_id = %id, "Cancelled pending request");
        entry.sender.send(Signal::Cancelled).is_ok()
    }

    /// Cancel every waiting request; returns how many were released.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Whether a request waits under `id`.
    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    /// The request event registered under `id`.
    #[must_use]
    pub fn request(&self, id: &CorrelationId) -> Option<Event> {
        self.entries.get(id).map(|entry| entry.request.clone())
    }

    /// Number of waiting requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.entries.len())
            .finish()
    }
}

/// The waiting side of a registration.
///
/// Dropping it without waiting removes the registration, so an abandoned
/// caller never leaks an entry.
pub struct PendingReply {
    id: CorrelationId,
    receiver: oneshot::Receiver<Signal>,
    registry: Arc<CorrelationRegistry>,
    registered_at: Instant,
    finished: bool,
}

impl PendingReply {
    /// Correlation id this reply is waiting for.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the reply, up to `timeout` (`None` waits forever).
    ///
    /// On timeout the registration is removed. If a resolver removed it first,
    /// its reply is already on the way and is returned instead of
    /// [`WaitOutcome::TimedOut`].
    pub async fn wait(self, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_or_settle(timeout, |_, _| false).await
    }

    /// Like [`wait`](Self::wait), but on timeout first gives `settle` the
    /// chance to resolve the registration itself, e.g. with a partial result.
    ///
    /// `settle` returns whether it resolved the entry. When it did, or when a
    /// resolver got there first, the delivered reply is returned instead of
    /// [`WaitOutcome::TimedOut`].
    pub async fn wait_or_settle(
        mut self,
        timeout: Option<Duration>,
        settle: impl FnOnce(&CorrelationRegistry, &CorrelationId) -> bool,
    ) -> WaitOutcome {
        let outcome = match timeout {
            None => self.receive().await,
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(Ok(signal)) => signal.into(),
                Ok(Err(_)) => WaitOutcome::Cancelled,
                Err(_) => {
                    if settle(self.registry.as_ref(), &self.id) {
                        self.receive().await
                    } else if self.registry.deregister(&self.id) {
                        CorrelationMetrics::record_timeout();
                        WaitOutcome::TimedOut
                    } else {
                        // A resolver holds the entry and signals immediately
                        self.receive().await
                    }
                },
            },
        };
        self.finished = true;
        if matches!(outcome, WaitOutcome::Reply(_)) {
            CorrelationMetrics::record_wait(self.registered_at.elapsed());
        }
        outcome
    }

    async fn receive(&mut self) -> WaitOutcome {
        match (&mut self.receiver).await {
            Ok(signal) => signal.into(),
            // Sender dropped without a signal: the entry was removed unsignalled
            Err(_) => WaitOutcome::Cancelled,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.deregister(&self.id);
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.id)
            .finish_non_exhaustive()
    }
}
