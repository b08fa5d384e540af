//! Queue storage with injectable failures.
//!
//! [`FlakyPersistenceStrategy`] wraps a shared in-memory store and can be
//! told to fail stores or removals, which is how tests simulate a disk that
//! fills up or a crash in the middle of a commit.

use correlator_runtime::queue::{
    EventHolder, ItemId, MemoryPersistenceStrategy, PersistenceError, QueuePersistenceStrategy,
    StoredItem,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory queue storage whose writes can be made to fail.
///
/// Clones share both the stored items and the failure switches.
///
/// # Example
///
/// ```
/// use correlator_runtime::queue::QueuePersistenceStrategy;
/// use correlator_testing::FlakyPersistenceStrategy;
///
/// let store = FlakyPersistenceStrategy::new();
/// store.fail_stores(true);
/// assert!(store.restore().unwrap().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlakyPersistenceStrategy {
    inner: MemoryPersistenceStrategy,
    fail_stores: Arc<AtomicBool>,
    fail_removes: Arc<AtomicBool>,
    stores: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
}

impl FlakyPersistenceStrategy {
    /// Create an empty, healthy store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent store fail (or succeed again).
    pub fn fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent removal fail (or succeed again).
    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful stores.
    #[must_use]
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// Number of successful removals.
    #[must_use]
    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Number of items currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn injected(operation: &str) -> PersistenceError {
        PersistenceError::Io {
            path: format!("flaky://{operation}").into(),
            source: std::io::Error::other(format!("injected {operation} failure")),
        }
    }
}

impl QueuePersistenceStrategy for FlakyPersistenceStrategy {
    fn store(&self, queue: &str, id: ItemId, holder: &EventHolder) -> Result<(), PersistenceError> {
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(Self::injected("store"));
        }
        self.inner.store(queue, id, holder)?;
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, queue: &str, id: ItemId) -> Result<(), PersistenceError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Self::injected("remove"));
        }
        self.inner.remove(queue, id)?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) -> Result<Vec<StoredItem>, PersistenceError> {
        self.inner.restore()
    }
}
