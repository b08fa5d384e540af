//! Staged event-driven service.
//!
//! A [`SedaService`] decouples a component from its callers: `process`
//! only enqueues the event and returns, and a pool of worker tasks takes
//! items off the service queue inside a queue transaction and runs the
//! component.
//!
//! - success or a handled failure commits the take
//! - an unhandled failure rolls it back, so the item is redelivered; the
//!   worker first pauses for the delay its redelivery policy prescribes while
//!   the item stays invisible to other workers
//! - after `max_redelivery` redeliveries, or once the redelivery policy is
//!   exhausted, the item is parked in the dead letter queue and the take is
//!   committed
//!
//! Results and failures go to the event's reply-to handler when the caller
//! attached one.

use crate::config::{QueueConfiguration, ThreadingProfile};
use crate::context::RuntimeContext;
use crate::dlq::DeadLetterQueue;
use crate::health::HealthCheck;
use crate::queue::{EventHolder, QueueError, QueueManager, QueueSession};
use crate::retry::{PolicyStatus, RetryPolicy, RetryPolicyTemplate, SimpleRetryPolicy};
use correlator_core::{
    Event, EventId, ExceptionOutcome, FlowIdentity, MessagingError, MessagingExceptionHandler,
    ProcessResult, Processor, ReplyTo,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Queued component with its own worker pool.
pub struct SedaService {
    name: String,
    context: Arc<RuntimeContext>,
    queues: QueueManager,
    component: Arc<dyn Processor>,
    exception_handler: Option<Arc<dyn MessagingExceptionHandler>>,
    dlq: DeadLetterQueue<Event>,
    profile: ThreadingProfile,
    redelivery: Option<RetryPolicyTemplate>,
    reply_to: Arc<DashMap<EventId, ReplyTo>>,
    redeliveries: Arc<DashMap<EventId, Redelivery>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SedaService {
    /// Service `name` running `component`, shaped by the context's threading
    /// profile, on a private in-memory queue manager.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        context: Arc<RuntimeContext>,
        component: Arc<dyn Processor>,
    ) -> Self {
        let config = context.config();
        let queues = QueueManager::new(config.queue);
        let dlq = DeadLetterQueue::new(config.dlq_max_size);
        let profile = config.threading.clone();
        Self {
            name: name.into(),
            context,
            queues,
            component,
            exception_handler: None,
            dlq,
            profile,
            redelivery: None,
            reply_to: Arc::new(DashMap::new()),
            redeliveries: Arc::new(DashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Use a shared queue manager, e.g. one with persistence.
    #[must_use]
    pub fn with_queue_manager(mut self, queues: QueueManager) -> Self {
        self.queues = queues;
        self
    }

    /// Decide which component failures count as handled.
    #[must_use]
    pub fn with_exception_handler(mut self, handler: Arc<dyn MessagingExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Park exhausted items in `dlq`.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, dlq: DeadLetterQueue<Event>) -> Self {
        self.dlq = dlq;
        self
    }

    /// Override the threading profile.
    #[must_use]
    pub fn with_threading_profile(mut self, profile: ThreadingProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Pace redeliveries of failing items with `template`.
    ///
    /// Each event gets its own policy instance. Without one, a failed item is
    /// redelivered after one poll interval.
    #[must_use]
    pub fn with_redelivery_policy(mut self, template: RetryPolicyTemplate) -> Self {
        self.redelivery = Some(template);
        self
    }

    /// Service name, also the name of its queue.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Items parked after exhausting their redeliveries.
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue<Event> {
        &self.dlq
    }

    /// Items waiting in the service queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues.session().queue(&self.name).size()
    }

    /// Start the queue manager if needed and spawn the workers.
    ///
    /// Returns the number of items restored from persistence.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] if stored items cannot be read.
    pub fn start(&self) -> Result<usize, QueueError> {
        let restored = self.queues.start()?;
        if let Some(size) = self.profile.max_buffer_size {
            let config = self.queues.queue_configuration(&self.name);
            self.queues.set_queue_configuration(
                &self.name,
                QueueConfiguration {
                    capacity: Some(size),
                    ..config
                },
            );
        }

        let worker = Arc::new(Worker {
            queue: self.name.clone(),
            queues: self.queues.clone(),
            component: Arc::clone(&self.component),
            exception_handler: self.exception_handler.clone(),
            dlq: self.dlq.clone(),
            profile: self.profile.clone(),
            redelivery: self.redelivery.clone().unwrap_or_else(|| {
                RetryPolicyTemplate::new(SimpleRetryPolicy::forever(self.profile.poll_interval()))
            }),
            reply_to: Arc::clone(&self.reply_to),
            redeliveries: Arc::clone(&self.redeliveries),
        });

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..self.profile.max_workers {
            let worker = Arc::clone(&worker);
            let shutdown = self.context.shutdown_signal();
            workers.push(self.context.handle().spawn(worker.run(index, shutdown)));
        }
        tracing::info!(
            service = %self.name,
            workers = self.profile.max_workers,
            restored,
            "SEDA service started"
        );
        Ok(restored)
    }

    /// Stop the workers. Queued items stay in the queue.
    pub fn stop(&self) {
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in &workers {
            handle.abort();
        }
        tracing::info!(service = %self.name, stopped = workers.len(), "SEDA service stopped");
    }

    /// Whether workers are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|handle| !handle.is_finished())
    }

    /// Queue health plus worker and dead letter counts.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let queues = self.queues.health();
        let check = HealthCheck::new(&self.name, queues.status);
        let check = match queues.message {
            Some(message) => check.with_message(message),
            None => check,
        };
        check
            .with_metadata("queued", self.queued())
            .with_metadata("dead_letters", self.dlq.len())
            .with_metadata("running", self.is_running())
    }

    async fn enqueue(&self, event: Event) -> ProcessResult {
        let event = if event.flow().is_some() {
            event
        } else {
            event.with_flow(FlowIdentity::new(&self.name, format!("seda://{}", self.name)))
        };
        let holder =
            EventHolder::from_event(&event).map_err(|e| MessagingError::Dispatch(e.to_string()))?;
        if let Some(reply_to) = event.reply_to() {
            self.reply_to.insert(event.id(), reply_to.clone());
        }

        let mut session = self.queues.session();
        if let Err(error) = session.queue(&self.name).put(holder).await {
            self.reply_to.remove(&event.id());
            return Err(MessagingError::Dispatch(format!(
                "{} could not enqueue event {}: {error}",
                self.name,
                event.id()
            )));
        }
        tracing::trace!(service = %self.name, event_id = %event.id(), "Event queued");
        Ok(None)
    }
}

impl Processor for SedaService {
    fn process(&self, event: Event) -> BoxFuture<'_, ProcessResult> {
        Box::pin(self.enqueue(event))
    }
}

impl Drop for SedaService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SedaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SedaService")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

/// Failed deliveries of one event so far and the policy pacing the next.
struct Redelivery {
    attempts: u32,
    policy: Mutex<Box<dyn RetryPolicy>>,
}

/// State shared by the workers of one service.
struct Worker {
    queue: String,
    queues: QueueManager,
    component: Arc<dyn Processor>,
    exception_handler: Option<Arc<dyn MessagingExceptionHandler>>,
    dlq: DeadLetterQueue<Event>,
    profile: ThreadingProfile,
    redelivery: RetryPolicyTemplate,
    reply_to: Arc<DashMap<EventId, ReplyTo>>,
    redeliveries: Arc<DashMap<EventId, Redelivery>>,
}

impl Worker {
    async fn run(self: Arc<Self>, index: usize, shutdown: watch::Receiver<bool>) {
        tracing::debug!(service = %self.queue, worker = index, "Worker started");
        while !*shutdown.borrow() {
            let mut session = self.queues.session();
            if let Err(error) = session.begin() {
                tracing::error!(service = %self.queue, %error, "Cannot begin queue transaction");
                break;
            }
            let polled = session.queue(&self.queue).poll(self.profile.poll_interval()).await;
            match polled {
                Ok(Some(holder)) => self.handle(session, holder).await,
                Ok(None) => {},
                Err(QueueError::Stopped) => break,
                Err(error) => {
                    tracing::error!(service = %self.queue, %error, "Taking from service queue failed");
                    tokio::time::sleep(self.profile.poll_interval()).await;
                },
            }
        }
        tracing::debug!(service = %self.queue, worker = index, "Worker stopped");
    }

    async fn handle(&self, mut session: QueueSession, holder: EventHolder) {
        let event_id = holder.event_id();
        let reply_to = self.reply_to.get(&event_id).map(|entry| entry.value().clone());
        let mut event = holder.into_event();
        if let Some(reply_to) = &reply_to {
            event = event.with_reply_to(reply_to.clone());
        }

        let outcome = match self.component.process(event.clone()).await {
            Ok(result) => Ok(result),
            Err(error) => match self.classify(&error, event.clone()) {
                ExceptionOutcome::Handled(substitute) => {
                    tracing::debug!(service = %self.queue, %event_id, %error, "Component failure handled");
                    Ok(Some(substitute))
                },
                ExceptionOutcome::Unhandled(failed) => Err(error.with_event(failed)),
            },
        };

        match outcome {
            Ok(result) => {
                if self.commit(&mut session, event_id) {
                    self.reply(reply_to.as_ref(), &event, result);
                }
            },
            Err(error) => self.failed(session, event, reply_to.as_ref(), error).await,
        }
    }

    fn classify(&self, error: &MessagingError, event: Event) -> ExceptionOutcome {
        match &self.exception_handler {
            Some(handler) => handler.handle_exception(error, event),
            None => ExceptionOutcome::Unhandled(event),
        }
    }

    async fn failed(
        &self,
        mut session: QueueSession,
        event: Event,
        reply_to: Option<&ReplyTo>,
        error: MessagingError,
    ) {
        let event_id = event.id();
        let (attempts, pause) = self.next_redelivery(event_id, &error);

        if let Some(delay) = pause {
            tracing::warn!(
                service = %self.queue,
                %event_id,
                attempts,
                max_redelivery = self.profile.max_redelivery,
                ?delay,
                %error,
                "Component failed, rolling back for redelivery"
            );
            // The take stays uncommitted, so no other worker sees the item meanwhile
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(rollback) = session.rollback() {
                tracing::error!(service = %self.queue, %event_id, error = %rollback, "Rollback failed");
            }
            return;
        }

        tracing::error!(
            service = %self.queue,
            %event_id,
            attempts,
            %error,
            "Redeliveries exhausted, moving event to dead letter queue"
        );
        self.dlq.push(event.clone().without_reply_to(), error.to_string(), attempts);
        if self.commit(&mut session, event_id) {
            if let Some(reply_to) = reply_to {
                reply_to.handler().process_exception_reply_to(error);
            }
        }
    }

    /// Count a failed delivery of `event_id` and ask its policy for the pause
    /// before the next one. `None` means no redelivery is left.
    fn next_redelivery(&self, event_id: EventId, error: &MessagingError) -> (u32, Option<Duration>) {
        let mut state = self.redeliveries.entry(event_id).or_insert_with(|| Redelivery {
            attempts: 0,
            policy: Mutex::new(self.redelivery.create_retry_instance()),
        });
        state.attempts += 1;
        let attempts = state.attempts;
        if attempts > self.profile.max_redelivery {
            return (attempts, None);
        }

        let policy = state.policy.get_mut().unwrap_or_else(PoisonError::into_inner);
        match policy.apply_policy(&anyhow::Error::new(error.clone())) {
            PolicyStatus::Retry { delay } => (attempts, Some(delay)),
            PolicyStatus::Exhausted => (attempts, None),
        }
    }

    /// Commit the take and forget per-event state. Returns whether the
    /// commit succeeded.
    fn commit(&self, session: &mut QueueSession, event_id: EventId) -> bool {
        match session.commit() {
            Ok(()) => {
                self.reply_to.remove(&event_id);
                self.redeliveries.remove(&event_id);
                true
            },
            Err(error) => {
                tracing::error!(service = %self.queue, %event_id, %error, "Commit of processed event failed");
                false
            },
        }
    }

    fn reply(&self, reply_to: Option<&ReplyTo>, request: &Event, result: Option<Event>) {
        let (Some(reply_to), Some(result)) = (reply_to, result) else {
            return;
        };
        tracing::trace!(service = %self.queue, event_id = %request.id(), "Sending reply");
        reply_to
            .handler()
            .process_reply_to(result.without_reply_to(), Some(request.message().clone()));
    }
}
