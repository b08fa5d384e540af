//! Named, optionally bounded and persistent, transactional queues.
//!
//! A [`QueueManager`] owns the queues; work happens through a
//! [`QueueSession`], which may run one local transaction at a time.
//!
//! Outside a transaction every operation applies immediately: a put is
//! persisted before it becomes visible and a take deletes the persisted
//! record before returning.
//!
//! Inside a transaction:
//! - puts and untakes are journaled and only persisted and made visible at
//!   commit; a put still claims a slot of a bounded queue up front, waiting
//!   for room like a plain put, and holds it until commit or rollback;
//! - takes remove the item from memory at once, but its persisted record is
//!   deleted only at commit;
//! - rollback returns taken items to the head of their queue in their
//!   original order.
//!
//! A crash before commit therefore loses no committed item and exposes no
//! uncommitted one: on restart [`QueueManager::start`] restores everything
//! still persisted, in id order.
//!
//! # Example
//!
//! ```
//! use correlator_core::{Event, FlowIdentity, Message};
//! use correlator_runtime::config::QueueConfiguration;
//! use correlator_runtime::queue::{EventHolder, QueueManager};
//!
//! # tokio_test::block_on(async {
//! let manager = QueueManager::new(QueueConfiguration::new());
//! manager.start().unwrap();
//!
//! let event = Event::new(Message::text("job")).with_flow(FlowIdentity::new("svc", "vm://jobs"));
//! let mut session = manager.session();
//! session.begin().unwrap();
//! session.queue("jobs").put(EventHolder::from_event(&event).unwrap()).await.unwrap();
//! assert_eq!(manager.session().queue("jobs").size(), 0);
//!
//! session.commit().unwrap();
//! assert_eq!(manager.session().queue("jobs").size(), 1);
//! # });
//! ```

mod persistence;

pub use persistence::{
    FilePersistenceStrategy, MemoryPersistenceStrategy, PersistenceError,
    QueuePersistenceStrategy, StoredItem,
};

use crate::config::QueueConfiguration;
use crate::health::{HealthCheck, HealthStatus};
use crate::metrics::QueueMetrics;
use crate::transaction::{ResourceManager, TransactionError, TransactionStatus, TransactionalSession};
use correlator_core::{CorrelationId, Event, EventId, ExchangePattern, FlowIdentity, Message};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

/// Queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Only events with a component and endpoint can be queued
    #[error("Event {0} has no flow identity and cannot be queued")]
    MissingFlowIdentity(EventId),

    /// Storage failed
    #[error("Queue persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    /// Illegal transaction use
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The manager is not started
    #[error("Queue manager is stopped")]
    Stopped,
}

/// Monotonic id of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(u64);

impl ItemId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

/// Serializable projection of an [`Event`] for queueing.
///
/// Carries no reply-to handler or other live resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHolder {
    event_id: EventId,
    component: String,
    endpoint: String,
    correlation_id: Option<CorrelationId>,
    correlation_group_size: Option<usize>,
    correlation_sequence: Option<usize>,
    session_id: String,
    exchange_pattern: ExchangePattern,
    message: Message,
}

impl EventHolder {
    /// Project `event`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::MissingFlowIdentity`] if the event has no
    /// component and endpoint.
    pub fn from_event(event: &Event) -> Result<Self, QueueError> {
        let flow = event
            .flow()
            .ok_or_else(|| QueueError::MissingFlowIdentity(event.id()))?;
        Ok(Self {
            event_id: event.id(),
            component: flow.component.clone(),
            endpoint: flow.endpoint.clone(),
            correlation_id: event.correlation_id().cloned(),
            correlation_group_size: event.correlation_group_size(),
            correlation_sequence: event.correlation_sequence(),
            session_id: event.session_id().to_string(),
            exchange_pattern: event.exchange_pattern(),
            message: event.message().clone(),
        })
    }

    /// Rebuild the event.
    #[must_use]
    pub fn into_event(self) -> Event {
        let mut event = Event::new(self.message)
            .with_id(self.event_id)
            .with_exchange_pattern(self.exchange_pattern)
            .with_session_id(self.session_id)
            .with_flow(FlowIdentity::new(self.component, self.endpoint));
        if let Some(id) = self.correlation_id {
            event = event.with_correlation_id(id);
        }
        if let Some(size) = self.correlation_group_size {
            event = event.with_correlation_group_size(size);
        }
        if let Some(sequence) = self.correlation_sequence {
            event = event.with_correlation_sequence(sequence);
        }
        event
    }

    /// Id of the projected event.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Component the event belongs to.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Endpoint the event arrived on.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: ItemId,
    holder: EventHolder,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueEntry>,
    // Slots claimed by puts that are not visible yet
    reserved: usize,
}

impl QueueState {
    fn has_room(&self, capacity: Option<usize>) -> bool {
        capacity.is_none_or(|capacity| self.items.len() + self.reserved < capacity)
    }
}

#[derive(Debug, Default)]
struct NamedQueue {
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
}

impl NamedQueue {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_all(&self) {
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

/// Journaled queue operation.
#[derive(Debug)]
enum QueueOp {
    Put { queue: String, entry: QueueEntry },
    Untake { queue: String, entry: QueueEntry },
    Take { queue: String, entry: QueueEntry },
}

/// Pending operations of one queue transaction.
#[derive(Debug, Default)]
pub struct QueueJournal {
    ops: Vec<QueueOp>,
}

impl QueueJournal {
    fn pending_puts(&self, queue: &str) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, QueueOp::Put { queue: q, .. } if q == queue))
            .count()
    }

    fn first_put(&self, queue: &str) -> Option<&QueueEntry> {
        self.ops.iter().find_map(|op| match op {
            QueueOp::Put { queue: q, entry } if q == queue => Some(entry),
            _ => None,
        })
    }

    fn take_first_put(&mut self, queue: &str) -> Option<QueueEntry> {
        let index = self
            .ops
            .iter()
            .position(|op| matches!(op, QueueOp::Put { queue: q, .. } if q == queue))?;
        match self.ops.remove(index) {
            QueueOp::Put { entry, .. } => Some(entry),
            _ => None,
        }
    }
}

struct ManagerInner {
    default_config: RwLock<QueueConfiguration>,
    overrides: DashMap<String, QueueConfiguration>,
    queues: DashMap<String, Arc<NamedQueue>>,
    persistence: Option<Arc<dyn QueuePersistenceStrategy>>,
    next_id: AtomicU64,
    started: AtomicBool,
}

/// Owner of all named queues.
///
/// Cheap to clone; clones share the queues.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    /// Manager without persistence. Call [`start`](Self::start) before use.
    #[must_use]
    pub fn new(default_config: QueueConfiguration) -> Self {
        Self::build(default_config, None)
    }

    /// Manager storing persistent queues through `strategy`.
    #[must_use]
    pub fn with_persistence(
        default_config: QueueConfiguration,
        strategy: Arc<dyn QueuePersistenceStrategy>,
    ) -> Self {
        Self::build(default_config, Some(strategy))
    }

    fn build(
        default_config: QueueConfiguration,
        persistence: Option<Arc<dyn QueuePersistenceStrategy>>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                default_config: RwLock::new(default_config),
                overrides: DashMap::new(),
                queues: DashMap::new(),
                persistence,
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the configuration used by queues without an override.
    pub fn set_default_queue_configuration(&self, config: QueueConfiguration) {
        *self
            .inner
            .default_config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Configure one queue.
    pub fn set_queue_configuration(&self, queue: impl Into<String>, config: QueueConfiguration) {
        self.inner.overrides.insert(queue.into(), config);
    }

    /// Effective configuration of `queue`.
    #[must_use]
    pub fn queue_configuration(&self, queue: &str) -> QueueConfiguration {
        self.inner.overrides.get(queue).map_or_else(
            || {
                *self
                    .inner
                    .default_config
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
            },
            |entry| *entry.value(),
        )
    }

    /// Start the manager, restoring persisted items in id order.
    ///
    /// Returns the number of restored items. Starting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] if storage cannot be read.
    pub fn start(&self) -> Result<usize, QueueError> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let restored = match &self.inner.persistence {
            Some(strategy) => strategy.restore()?,
            None => Vec::new(),
        };

        let count = restored.len();
        let mut max_id = 0;
        for item in restored {
            max_id = max_id.max(item.id.get());
            let queue = self.named(&item.queue);
            queue.state().items.push_back(QueueEntry {
                id: item.id,
                holder: item.holder,
            });
        }
        self.inner.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        self.inner.started.store(true, Ordering::SeqCst);
        tracing::info!(restored = count, "Queue manager started");
        Ok(count)
    }

    /// Stop the manager. In-memory items are dropped; persisted ones stay
    /// and come back on the next start.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        for queue in self.inner.queues.iter() {
            queue.state().items.clear();
            queue.wake_all();
        }
        tracing::info!("Queue manager stopped");
    }

    /// Whether the manager is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Open a session.
    #[must_use]
    pub fn session(&self) -> QueueSession {
        QueueSession {
            tx: TransactionalSession::new(self.clone()),
        }
    }

    /// Queue utilization health.
    ///
    /// Degraded above 80% of a bounded queue's capacity, unhealthy when one
    /// is full or the manager is stopped.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        if !self.is_started() {
            return HealthCheck::unhealthy("queues", "Queue manager is stopped");
        }
        let mut status = HealthStatus::Healthy;
        let mut total = 0;
        for entry in self.inner.queues.iter() {
            let len = entry.value().state().items.len();
            total += len;
            if let Some(capacity) = self.queue_configuration(entry.key()).capacity {
                status = status.worst(HealthStatus::from_utilization(len, capacity));
            }
        }
        HealthCheck::new("queues", status)
            .with_metadata("queues", self.inner.queues.len())
            .with_metadata("items", total)
    }

    fn named(&self, name: &str) -> Arc<NamedQueue> {
        if let Some(queue) = self.inner.queues.get(name) {
            return Arc::clone(queue.value());
        }
        Arc::clone(
            self.inner
                .queues
                .entry(name.to_string())
                .or_default()
                .value(),
        )
    }

    fn ensure_started(&self) -> Result<(), QueueError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(QueueError::Stopped)
        }
    }

    fn next_id(&self) -> ItemId {
        ItemId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn persistence_for(&self, queue: &str) -> Option<&Arc<dyn QueuePersistenceStrategy>> {
        if self.queue_configuration(queue).persistent {
            self.inner.persistence.as_ref()
        } else {
            None
        }
    }

    fn store(&self, queue: &str, entry: &QueueEntry) -> Result<(), PersistenceError> {
        match self.persistence_for(queue) {
            Some(strategy) => strategy.store(queue, entry.id, &entry.holder),
            None => Ok(()),
        }
    }

    fn unstore(&self, queue: &str, id: ItemId) -> Result<(), PersistenceError> {
        match self.persistence_for(queue) {
            Some(strategy) => strategy.remove(queue, id),
            None => Ok(()),
        }
    }

    /// Claim a slot of `name` for an item that becomes visible later.
    fn try_reserve(&self, name: &str) -> bool {
        let capacity = self.queue_configuration(name).capacity;
        let queue = self.named(name);
        let mut state = queue.state();
        if !state.has_room(capacity) {
            return false;
        }
        state.reserved += 1;
        true
    }

    /// Give back a slot claimed by [`try_reserve`](Self::try_reserve).
    fn release(&self, name: &str) {
        let queue = self.named(name);
        let mut state = queue.state();
        state.reserved = state.reserved.saturating_sub(1);
        drop(state);
        queue.not_full.notify_waiters();
    }

    /// Turn a claimed slot into a visible item at the tail.
    fn fill(&self, name: &str, entry: QueueEntry) {
        let queue = self.named(name);
        let mut state = queue.state();
        state.reserved = state.reserved.saturating_sub(1);
        state.items.push_back(entry);
        drop(state);
        queue.not_empty.notify_waiters();
        QueueMetrics::record_put(name);
    }

    fn try_pop(&self, name: &str) -> Option<QueueEntry> {
        let queue = self.named(name);
        let entry = queue.state().items.pop_front();
        if entry.is_some() {
            queue.not_full.notify_waiters();
            QueueMetrics::record_take(name);
        }
        entry
    }

    fn push_front(&self, name: &str, entry: QueueEntry) {
        let queue = self.named(name);
        queue.state().items.push_front(entry);
        queue.not_empty.notify_waiters();
    }

    /// Claim a slot, waiting for room until `deadline`. Returns whether one
    /// was claimed.
    async fn reserve_until(&self, name: &str, deadline: Option<Instant>) -> Result<bool, QueueError> {
        let queue = self.named(name);
        loop {
            self.ensure_started()?;
            let notified = queue.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_reserve(name) {
                return Ok(true);
            }
            if !wait(notified, deadline).await {
                return Ok(false);
            }
        }
    }

    /// Persist then append, waiting for room until `deadline`. Returns
    /// whether it was added.
    ///
    /// Storage runs with the slot claimed but the queue unlocked.
    async fn push_until(
        &self,
        name: &str,
        entry: QueueEntry,
        deadline: Option<Instant>,
    ) -> Result<bool, QueueError> {
        if !self.reserve_until(name, deadline).await? {
            return Ok(false);
        }
        if let Err(err) = self.store(name, &entry) {
            self.release(name);
            return Err(err.into());
        }
        self.fill(name, entry);
        Ok(true)
    }

    /// Remove the head, waiting for an item until `deadline`.
    async fn pop_until(
        &self,
        name: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let queue = self.named(name);
        loop {
            self.ensure_started()?;
            let notified = queue.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_pop(name) {
                return Ok(Some(entry));
            }
            if !wait(notified, deadline).await {
                return Ok(None);
            }
        }
    }

    fn restore_takes(&self, taken: Vec<(String, QueueEntry)>) {
        // Reverse so the earliest take ends up first
        for (queue, entry) in taken.into_iter().rev() {
            self.push_front(&queue, entry);
        }
    }
}

/// Wait for a notification; `false` once `deadline` passed.
async fn wait(notified: Pin<&mut Notified<'_>>, deadline: Option<Instant>) -> bool {
    match deadline {
        None => {
            notified.await;
            true
        },
        Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
    }
}

impl ResourceManager for QueueManager {
    type Journal = QueueJournal;
    type Error = QueueError;

    fn commit(&self, journal: QueueJournal) -> Result<(), QueueError> {
        let mut visible = Vec::new();
        let mut taken = Vec::new();
        for op in journal.ops {
            match op {
                QueueOp::Put { queue, entry } => visible.push((queue, entry, false)),
                QueueOp::Untake { queue, entry } => visible.push((queue, entry, true)),
                QueueOp::Take { queue, entry } => taken.push((queue, entry)),
            }
        }

        // Persist everything new first so a failure leaves no partial commit
        for (index, (queue, entry, _)) in visible.iter().enumerate() {
            if let Err(err) = self.store(queue, entry) {
                for (queue, entry, _) in &visible[..index] {
                    if let Err(undo) = self.unstore(queue, entry.id) {
                        tracing::warn!(%queue, error = %undo, "Failed to undo partial commit");
                    }
                }
                for (queue, _, untake) in &visible {
                    if !untake {
                        self.release(queue);
                    }
                }
                self.restore_takes(taken);
                QueueMetrics::record_rollback();
                return Err(err.into());
            }
        }

        for (queue, entry) in &taken {
            // A leftover record means a redelivery after restart, never a loss
            if let Err(err) = self.unstore(queue, entry.id) {
                tracing::warn!(%queue, item = %entry.id, error = %err, "Failed to delete committed take");
            }
        }

        for (queue, entry, untake) in visible {
            if untake {
                self.push_front(&queue, entry);
            } else {
                self.fill(&queue, entry);
            }
        }
        QueueMetrics::record_commit();
        Ok(())
    }

    fn rollback(&self, journal: QueueJournal) -> Result<(), QueueError> {
        let mut taken = Vec::new();
        for op in journal.ops {
            match op {
                QueueOp::Take { queue, entry } => taken.push((queue, entry)),
                QueueOp::Put { queue, .. } => self.release(&queue),
                QueueOp::Untake { .. } => {},
            }
        }
        if !taken.is_empty() {
            QueueMetrics::record_redelivery();
        }
        self.restore_takes(taken);
        QueueMetrics::record_rollback();
        Ok(())
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.inner.queues.len())
            .field("persistent", &self.inner.persistence.is_some())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

/// A unit of work against a [`QueueManager`].
///
/// Dropping a session with an active transaction rolls it back.
#[derive(Debug)]
pub struct QueueSession {
    tx: TransactionalSession<QueueManager>,
}

impl QueueSession {
    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transaction`] if one is already active.
    pub fn begin(&mut self) -> Result<(), QueueError> {
        Ok(self.tx.begin()?)
    }

    /// Commit the active transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] if storing failed (the
    /// transaction is then rolled back), or [`QueueError::Transaction`] if no
    /// transaction is active.
    pub fn commit(&mut self) -> Result<(), QueueError> {
        self.tx.commit()
    }

    /// Roll back the active transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transaction`] if no transaction is active.
    pub fn rollback(&mut self) -> Result<(), QueueError> {
        self.tx.rollback()
    }

    /// Transaction state.
    #[must_use]
    pub const fn status(&self) -> TransactionStatus {
        self.tx.status()
    }

    /// Whether a transaction is in progress.
    #[must_use]
    pub const fn is_transacted(&self) -> bool {
        self.tx.is_active()
    }

    /// Handle on the queue called `name`.
    pub fn queue(&mut self, name: impl Into<String>) -> Queue<'_> {
        Queue {
            session: self,
            name: name.into(),
        }
    }

    const fn manager(&self) -> &QueueManager {
        self.tx.manager()
    }
}

impl Drop for QueueSession {
    fn drop(&mut self) {
        if self.tx.is_active() {
            tracing::debug!("Rolling back queue transaction of dropped session");
            if let Err(err) = self.tx.rollback() {
                tracing::error!(error = %err, "Rollback of dropped session failed");
            }
        }
    }
}

/// Operations on one named queue within a session.
#[derive(Debug)]
pub struct Queue<'a> {
    session: &'a mut QueueSession,
    name: String,
}

impl Queue<'_> {
    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item, waiting while a bounded queue is full.
    ///
    /// Inside a transaction the put waits for room the same way, then holds
    /// its slot until the transaction ends while the item stays invisible.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] if storing failed, or
    /// [`QueueError::Stopped`].
    pub async fn put(&mut self, holder: EventHolder) -> Result<(), QueueError> {
        self.offer_until(holder, None).await.map(|_| ())
    }

    /// Append an item, giving up after `timeout` if the queue stays full.
    ///
    /// Slots held by uncommitted puts of any session count as taken.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] if storing failed, or
    /// [`QueueError::Stopped`].
    pub async fn offer(&mut self, holder: EventHolder, timeout: Duration) -> Result<bool, QueueError> {
        self.offer_until(holder, Some(Instant::now() + timeout)).await
    }

    /// Remove the head item, waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Stopped`] if the manager stops, or
    /// [`QueueError::Persistence`] if the persisted record cannot be deleted.
    pub async fn take(&mut self) -> Result<EventHolder, QueueError> {
        loop {
            if let Some(holder) = self.poll_until(None).await? {
                return Ok(holder);
            }
        }
    }

    /// Remove the head item, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Stopped`] if the manager is stopped, or
    /// [`QueueError::Persistence`] if the persisted record cannot be deleted.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<EventHolder>, QueueError> {
        self.poll_until(Some(Instant::now() + timeout)).await
    }

    /// The head item without removing it.
    #[must_use]
    pub fn peek(&mut self) -> Option<EventHolder> {
        let manager = self.session.manager().clone();
        let queue = manager.named(&self.name);
        if let Some(entry) = queue.state().items.front() {
            return Some(entry.holder.clone());
        }
        let name = &self.name;
        self.session
            .tx
            .with_journal(|journal| journal.first_put(name).map(|e| e.holder.clone()))
            .flatten()
    }

    /// Put an item back at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] if storing failed, or
    /// [`QueueError::Stopped`].
    pub fn untake(&mut self, holder: EventHolder) -> Result<(), QueueError> {
        let manager = self.session.manager().clone();
        manager.ensure_started()?;
        let entry = QueueEntry {
            id: manager.next_id(),
            holder,
        };
        let name = self.name.clone();
        let journaled = self.session.tx.with_journal(|journal| {
            journal.ops.push(QueueOp::Untake {
                queue: name,
                entry: entry.clone(),
            });
        });
        if journaled.is_none() {
            manager.store(&self.name, &entry)?;
            manager.push_front(&self.name, entry);
        }
        Ok(())
    }

    /// Number of items, counting this session's uncommitted puts.
    #[must_use]
    pub fn size(&mut self) -> usize {
        let manager = self.session.manager().clone();
        let visible = manager.named(&self.name).state().items.len();
        let name = &self.name;
        visible
            + self
                .session
                .tx
                .with_journal(|journal| journal.pending_puts(name))
                .unwrap_or(0)
    }

    async fn offer_until(
        &mut self,
        holder: EventHolder,
        deadline: Option<Instant>,
    ) -> Result<bool, QueueError> {
        let manager = self.session.manager().clone();
        manager.ensure_started()?;
        let entry = QueueEntry {
            id: manager.next_id(),
            holder,
        };

        if !self.session.is_transacted() {
            return manager.push_until(&self.name, entry, deadline).await;
        }

        if !manager.reserve_until(&self.name, deadline).await? {
            return Ok(false);
        }
        let name = self.name.clone();
        let journaled = self.session.tx.with_journal(|journal| {
            journal.ops.push(QueueOp::Put { queue: name, entry });
        });
        if journaled.is_none() {
            manager.release(&self.name);
            return Err(TransactionError::IllegalState {
                operation: "put",
                status: self.session.status(),
            }
            .into());
        }
        Ok(true)
    }

    async fn poll_until(&mut self, deadline: Option<Instant>) -> Result<Option<EventHolder>, QueueError> {
        let manager = self.session.manager().clone();

        if self.session.is_transacted() {
            // Uncommitted own puts are visible to this session only
            if manager.named(&self.name).state().items.is_empty() {
                let name = &self.name;
                if let Some(entry) = self
                    .session
                    .tx
                    .with_journal(|journal| journal.take_first_put(name))
                    .flatten()
                {
                    manager.release(&self.name);
                    return Ok(Some(entry.holder));
                }
            }
            let Some(entry) = manager.pop_until(&self.name, deadline).await? else {
                return Ok(None);
            };
            let holder = entry.holder.clone();
            let name = self.name.clone();
            let journaled = self.session.tx.with_journal(|journal| {
                journal.ops.push(QueueOp::Take { queue: name, entry });
            });
            debug_assert!(journaled.is_some(), "session left its transaction while taking");
            return Ok(Some(holder));
        }

        let Some(entry) = manager.pop_until(&self.name, deadline).await? else {
            return Ok(None);
        };
        if let Err(err) = manager.unstore(&self.name, entry.id) {
            manager.push_front(&self.name, entry);
            return Err(err.into());
        }
        Ok(Some(entry.holder))
    }
}
