//! # Correlator Runtime
//!
//! Asynchronous request/reply correlation, event-group aggregation, retry
//! templates and transactional queue/file resources.
//!
//! ## Core Components
//!
//! - **`RuntimeContext`**: explicit shared state (registries, scheduler,
//!   config, shutdown signal) handed to every component
//! - **`AsyncRequestReplyRequester`**: turns an asynchronous one-way
//!   destination into a request/response exchange
//! - **`EventCorrelator`**: groups replies by correlation id and aggregates
//!   them exactly once under an `AggregationPolicy`
//! - **`RetryPolicyTemplate`**: runs a unit of work under a retry policy
//! - **`QueueManager`** / **`FileManager`**: local transactions over queues
//!   and files
//! - **`SedaService`**: a queued component with its own worker pool
//!
//! ## Example
//!
//! ```
//! use correlator_core::{Event, ExchangePattern, FnProcessor, Message, Processor};
//! use correlator_runtime::{AsyncRequestReplyRequester, RuntimeConfig, RuntimeContext};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let context = RuntimeContext::start(RuntimeConfig::default()).unwrap();
//!
//! // A destination that answers through the reply-to handler it is given
//! let echo: Arc<dyn Processor> = Arc::new(FnProcessor::new(|event: Event| {
//!     if let Some(reply_to) = event.reply_to() {
//!         reply_to.handler().process_reply_to(event.derive(Message::text("pong")), None);
//!     }
//!     Ok(None)
//! }));
//!
//! let requester = AsyncRequestReplyRequester::builder(context).listener(echo).build();
//! let request = Event::new(Message::text("ping"))
//!     .with_exchange_pattern(ExchangePattern::RequestResponse);
//!
//! let reply = requester.process(request).await.unwrap().unwrap();
//! assert_eq!(reply.message_as_string(), "pong");
//! # });
//! ```

pub mod aggregator;
pub mod config;
pub mod context;
pub mod correlation;
pub mod correlator;
pub mod dlq;
pub mod file;
pub mod group;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod reply;
pub mod requester;
pub mod retry;
pub mod seda;
pub mod transaction;

pub use aggregator::{
    AggregationError, AggregationPolicy, AggregationStrategy, CollectionStrategy,
    ConcatenationStrategy, FnStrategy, ResponseCorrelationAggregator, SingleResponseRouter,
};
pub use config::{
    CancellationMode, ConfigError, CorrelatorConfig, QueueConfiguration, RequesterConfig,
    RetryConfig, RuntimeConfig, ThreadingProfile,
};
pub use context::{ContextError, RuntimeContext};
pub use correlation::{CorrelationRegistry, PendingReply, WaitOutcome};
pub use correlator::{EventCorrelator, GroupRegistry};
pub use dlq::{DeadLetter, DeadLetterQueue};
pub use file::{FileDelivery, FileError, FileManager, FileReceiver, TransactedFileSession};
pub use group::{AddOutcome, EventGroup, GroupState};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use queue::{
    EventHolder, FilePersistenceStrategy, MemoryPersistenceStrategy, QueueError, QueueManager,
    QueuePersistenceStrategy, QueueSession,
};
pub use reply::{CorrelatingReplyToHandler, ReplyListener, ReplyToHandlerDecorator};
pub use requester::{AsyncRequestReplyRequester, RequesterBuilder};
pub use retry::{
    ExponentialBackoffPolicy, LoggingRetryNotifier, NoRetryPolicy, PolicyStatus, RetryCallback,
    RetryContext, RetryCount, RetryError, RetryNotifier, RetryPolicy, RetryPolicyFactory,
    RetryPolicyTemplate, SimpleRetryPolicy,
};
pub use seda::SedaService;
pub use transaction::{ResourceManager, TransactionError, TransactionStatus, TransactionalSession};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
