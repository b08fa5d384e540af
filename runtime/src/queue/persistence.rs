//! Durable storage for queued items.
//!
//! A strategy stores each item under its queue name and [`ItemId`]. Ids grow
//! monotonically, so restoring in id order rebuilds every queue in its
//! original order. Records are bincode encoded.

use super::{EventHolder, ItemId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use thiserror::Error;

const RECORD_EXTENSION: &str = "msg";

/// Persistence failures.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A record could not be encoded
    #[error("Failed to encode queue record: {0}")]
    Encode(String),

    /// A stored record could not be decoded
    #[error("Failed to decode queue record {location}: {reason}")]
    Decode {
        /// Where the record lives
        location: String,
        /// Decoder message
        reason: String,
    },
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An item read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    /// Queue the item belongs to
    pub queue: String,
    /// Item id
    pub id: ItemId,
    /// The item
    pub holder: EventHolder,
}

/// Storage behind persistent queues.
///
/// Calls are synchronous and made while the caller holds the queue, so a
/// store completes before the item becomes visible.
pub trait QueuePersistenceStrategy: Send + Sync {
    /// Store an item.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the item could not be written.
    fn store(&self, queue: &str, id: ItemId, holder: &EventHolder) -> Result<(), PersistenceError>;

    /// Remove an item. Removing a missing item succeeds.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the item could not be removed.
    fn remove(&self, queue: &str, id: ItemId) -> Result<(), PersistenceError>;

    /// Every stored item, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if storage cannot be read.
    fn restore(&self) -> Result<Vec<StoredItem>, PersistenceError>;
}

#[derive(Serialize, Deserialize)]
struct Record {
    queue: String,
    holder: EventHolder,
}

fn encode(queue: &str, holder: &EventHolder) -> Result<Vec<u8>, PersistenceError> {
    bincode::serialize(&Record {
        queue: queue.to_string(),
        holder: holder.clone(),
    })
    .map_err(|e| PersistenceError::Encode(e.to_string()))
}

fn decode(bytes: &[u8], location: impl Into<String>) -> Result<Record, PersistenceError> {
    bincode::deserialize(bytes).map_err(|e| PersistenceError::Decode {
        location: location.into(),
        reason: e.to_string(),
    })
}

/// In-memory storage.
///
/// Clones share the same store, so a second manager built with a clone
/// recovers what the first one persisted, as it would from disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistenceStrategy {
    records: Arc<Mutex<BTreeMap<(ItemId, String), Vec<u8>>>>,
}

impl MemoryPersistenceStrategy {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueuePersistenceStrategy for MemoryPersistenceStrategy {
    fn store(&self, queue: &str, id: ItemId, holder: &EventHolder) -> Result<(), PersistenceError> {
        let bytes = encode(queue, holder)?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((id, queue.to_string()), bytes);
        Ok(())
    }

    fn remove(&self, queue: &str, id: ItemId) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(id, queue.to_string()));
        Ok(())
    }

    fn restore(&self) -> Result<Vec<StoredItem>, PersistenceError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .map(|((id, queue), bytes)| {
                let record = decode(bytes, format!("{queue}/{id}"))?;
                Ok(StoredItem {
                    queue: record.queue,
                    id: *id,
                    holder: record.holder,
                })
            })
            .collect()
    }
}

/// One file per item under `<root>/<queue>/<id>.msg`.
///
/// Files are written to a temporary file in the same directory and renamed
/// into place, so a crash never leaves a torn record behind.
#[derive(Debug, Clone)]
pub struct FilePersistenceStrategy {
    root: PathBuf,
}

impl FilePersistenceStrategy {
    /// Store items below `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(sanitize(queue))
    }

    fn record_path(&self, queue: &str, id: ItemId) -> PathBuf {
        self.queue_dir(queue)
            .join(format!("{id}.{RECORD_EXTENSION}"))
    }

    fn restore_dir(&self, dir: &Path, items: &mut Vec<StoredItem>) -> Result<(), PersistenceError> {
        let entries = std::fs::read_dir(dir).map_err(|e| PersistenceError::io(dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| PersistenceError::io(dir, e))?.path();
            let Some(id) = parse_record_name(&path) else {
                tracing::debug!(path = %path.display(), "Skipping non-record file in queue store");
                continue;
            };
            let bytes = std::fs::read(&path).map_err(|e| PersistenceError::io(&path, e))?;
            let record = decode(&bytes, path.display().to_string())?;
            items.push(StoredItem {
                queue: record.queue,
                id,
                holder: record.holder,
            });
        }
        Ok(())
    }
}

impl QueuePersistenceStrategy for FilePersistenceStrategy {
    fn store(&self, queue: &str, id: ItemId, holder: &EventHolder) -> Result<(), PersistenceError> {
        let bytes = encode(queue, holder)?;
        let dir = self.queue_dir(queue);
        std::fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, e))?;

        let mut temp = NamedTempFile::new_in(&dir).map_err(|e| PersistenceError::io(&dir, e))?;
        temp.write_all(&bytes)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| PersistenceError::io(temp.path(), e))?;

        let path = self.record_path(queue, id);
        temp.persist(&path)
            .map_err(|e| PersistenceError::io(&path, e.error))?;
        Ok(())
    }

    fn remove(&self, queue: &str, id: ItemId) -> Result<(), PersistenceError> {
        let path = self.record_path(queue, id);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(PersistenceError::io(&path, e)),
            _ => Ok(()),
        }
    }

    fn restore(&self) -> Result<Vec<StoredItem>, PersistenceError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| PersistenceError::io(&self.root, e))?;
        for entry in entries {
            let path = entry.map_err(|e| PersistenceError::io(&self.root, e))?.path();
            if path.is_dir() {
                self.restore_dir(&path, &mut items)?;
            }
        }
        items.sort_by_key(|item| item.id);
        Ok(items)
    }
}

fn sanitize(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_record_name(path: &Path) -> Option<ItemId> {
    if path.extension()? != RECORD_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok().map(ItemId::new)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use correlator_core::{Event, FlowIdentity, Message};

    fn holder(text: &str) -> EventHolder {
        let event = Event::new(Message::text(text)).with_flow(FlowIdentity::new("svc", "vm://in"));
        EventHolder::from_event(&event).unwrap()
    }

    #[test]
    fn test_memory_store_is_shared_between_clones() {
        let store = MemoryPersistenceStrategy::new();
        let clone = store.clone();

        store.store("q", ItemId::new(2), &holder("b")).unwrap();
        store.store("q", ItemId::new(1), &holder("a")).unwrap();

        let restored = clone.restore().unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].holder.message().as_string(), "a");

        clone.remove("q", ItemId::new(1)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store_round_trips_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistenceStrategy::new(dir.path());

        store.store("orders/in", ItemId::new(7), &holder("late")).unwrap();
        store.store("audit", ItemId::new(3), &holder("early")).unwrap();

        let restored = FilePersistenceStrategy::new(dir.path()).restore().unwrap();
        let order: Vec<_> = restored.iter().map(|i| (i.queue.as_str(), i.id.get())).collect();
        assert_eq!(order, vec![("audit", 3), ("orders/in", 7)]);
    }

    #[test]
    fn test_file_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistenceStrategy::new(dir.path());

        store.store("q", ItemId::new(1), &holder("x")).unwrap();
        store.remove("q", ItemId::new(1)).unwrap();
        store.remove("q", ItemId::new(1)).unwrap();

        assert!(store.restore().unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistenceStrategy::new(dir.path().join("absent"));
        assert!(store.restore().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let queue_dir = dir.path().join("q");
        std::fs::create_dir_all(&queue_dir).unwrap();
        std::fs::write(queue_dir.join("00000000000000000001.msg"), b"garbage").unwrap();

        let result = FilePersistenceStrategy::new(dir.path()).restore();
        assert!(matches!(result, Err(PersistenceError::Decode { .. })));
    }
}
