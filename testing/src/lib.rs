//! # Correlator Testing
//!
//! Testing utilities for the asynchronous request/reply correlation runtime.
//!
//! This crate provides:
//! - Test doubles for destinations, exception strategies, exception
//!   listeners, retry notifiers and reply sources
//! - [`FlakyPersistenceStrategy`] for queue crash and failure scenarios
//! - [`ExchangeTest`], a Given-When-Then harness for one exchange
//! - proptest strategies for group sizes and arrival orders
//!
//! ## Example
//!
//! ```
//! use correlator_core::{Event, Message};
//! use correlator_testing::mocks::{FailingListener, FailureMode, RecordingExceptionHandler};
//! use correlator_testing::ExchangeTest;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let strategy = RecordingExceptionHandler::handling("fallback");
//!
//! ExchangeTest::new()
//!     .given_listener(Arc::new(FailingListener::new(FailureMode::ExceptionReply, "boom")))
//!     .with_requester(move |builder| builder.exception_handler(Arc::new(strategy)))
//!     .when_request(Event::new(Message::text("order")))
//!     .then_reply(|reply| assert_eq!(reply.message_as_string(), "fallback"))
//!     .run()
//!     .await
//!     .unwrap();
//! # });
//! ```

pub mod mocks;
pub mod persistence_mocks;
pub mod properties;

pub use exchange_test::ExchangeTest;
pub use mocks::{
    EchoListener, FailingListener, FailureMode, ManualReplySource, RecordingExceptionHandler,
    RecordingExceptionListener, RecordingRetryNotifier, SilentListener,
};
pub use persistence_mocks::FlakyPersistenceStrategy;

use tracing_subscriber::EnvFilter;

/// Install a test subscriber that writes through the test harness's
/// capture, filtered by `RUST_LOG` (default `debug`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
