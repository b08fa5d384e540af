//! Dead letter queue for work that could not be completed.
//!
//! The SEDA service parks items here once their redelivery budget is spent,
//! and a queue of event lists can stand in as the correlator's exception
//! listener so failed or expired groups are kept for inspection.

use crate::metrics::DlqMetrics;
use chrono::{DateTime, Utc};
use correlator_core::{Event, ExceptionListener, MessagingError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Dead letter queue entry
///
/// A failed payload with metadata about the failure.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The failed payload
    pub payload: T,

    /// Delivery attempts made before giving up
    pub attempts: u32,

    /// The error message from the last failure
    pub reason: String,

    /// When the entry was parked
    pub failed_at: DateTime<Utc>,
}

/// Bounded FIFO of failures.
///
/// - Oldest entries are dropped when full
/// - Clones share the same storage
/// - Pushes, drops and drains are counted in metrics
///
/// # Example
///
/// ```
/// use correlator_runtime::dlq::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(2);
/// dlq.push("a", "timeout", 3);
/// dlq.push("b", "timeout", 3);
/// dlq.push("c", "timeout", 3);
///
/// let drained: Vec<_> = dlq.drain().into_iter().map(|e| e.payload).collect();
/// assert_eq!(drained, vec!["b", "c"]);
/// ```
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create a queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Park a failed payload, dropping the oldest entry when full.
    pub fn push(&self, payload: T, reason: impl Into<String>, attempts: u32) {
        let mut queue = self.entries();

        if queue.len() >= self.max_size {
            queue.pop_front();
            DlqMetrics::record_dropped();
            tracing::warn!(
                max_size = self.max_size,
                "DLQ at capacity, dropping oldest entry"
            );
        }

        let reason = reason.into();
        tracing::warn!(attempts, %reason, queue_size = queue.len() + 1, "Added to dead letter queue");
        queue.push_back(DeadLetter {
            payload,
            attempts,
            reason,
            failed_at: Utc::now(),
        });
        DlqMetrics::record_pushed(queue.len());
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return all entries, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let entries: Vec<_> = self.entries().drain(..).collect();
        DlqMetrics::record_drained(entries.len());
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }

    /// The oldest entry.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter<T>>
    where
        T: Clone,
    {
        self.entries().front().cloned()
    }

    /// Capacity.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<DeadLetter<T>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ExceptionListener for DeadLetterQueue<Vec<Event>> {
    fn exception_thrown(&self, error: &MessagingError) {
        let events = match error.event() {
            Some(event) if error.group_events().is_empty() => vec![event.clone()],
            _ => error.group_events().to_vec(),
        };
        self.push(events, error.to_string(), 1);
    }
}
