//! Prometheus metrics for the correlation kernel.
//!
//! Every component records through the `metrics` facade; nothing is exported
//! until a recorder is installed, e.g. with [`MetricsServer::start`].
//!
//! Metric families:
//! - `correlation_*`: registry registrations, resolutions, timeouts, late replies
//! - `aggregation_*`: completed, failed and expired event groups
//! - `queue_*`: puts, takes, commits, rollbacks and redeliveries
//! - `retry_*`: attempts, successes and exhausted sequences
//! - `dlq_*`: dead letter queue size and traffic
//!
//! # Example
//!
//! ```rust,no_run
//! use correlator_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! println!("{}", server.render().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is advertised on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (common in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Correlation registry
    describe_counter!(
        "correlation_registered_total",
        "Requests registered for an asynchronous reply"
    );
    describe_counter!(
        "correlation_resolved_total",
        "Pending requests resolved with a reply or a failure"
    );
    describe_counter!(
        "correlation_discarded_total",
        "Late or duplicate replies that found no pending request"
    );
    describe_counter!(
        "correlation_timeouts_total",
        "Requests that gave up waiting for a reply"
    );
    describe_counter!(
        "correlation_cancelled_total",
        "Requests whose wait was cancelled"
    );
    describe_gauge!("correlation_pending", "Requests currently waiting for a reply");
    describe_histogram!(
        "correlation_wait_duration_seconds",
        "Time between dispatch and reply"
    );

    // Event groups
    describe_counter!("aggregation_completed_total", "Event groups aggregated");
    describe_counter!("aggregation_failed_total", "Event groups whose aggregation failed");
    describe_counter!("aggregation_expired_total", "Event groups that timed out");
    describe_counter!(
        "aggregation_missed_replies_total",
        "Events that arrived for an already processed group"
    );
    describe_gauge!("aggregation_open_groups", "Event groups still collecting");

    // Queues
    describe_counter!("queue_put_total", "Items made visible on a queue");
    describe_counter!("queue_take_total", "Items taken from a queue");
    describe_counter!("queue_commit_total", "Committed queue transactions");
    describe_counter!("queue_rollback_total", "Rolled back queue transactions");
    describe_counter!("queue_redelivery_total", "Items redelivered after a rollback");

    // Retry
    describe_counter!("retry_attempts_total", "Failed attempts seen by retry templates");
    describe_counter!("retry_successes_total", "Retry sequences that eventually succeeded");
    describe_counter!("retry_exhausted_total", "Retry sequences that gave up");

    // Dead letter queue
    describe_gauge!("dlq_size", "Entries in the dead letter queue");
    describe_counter!("dlq_pushed_total", "Entries added to the dead letter queue");
    describe_counter!("dlq_dropped_total", "Entries dropped because the queue was full");
    describe_counter!("dlq_drained_total", "Entries drained from the dead letter queue");
}

/// Correlation registry metrics recorder.
pub struct CorrelationMetrics;

impl CorrelationMetrics {
    /// Record a registration.
    pub fn record_registered(pending: usize) {
        counter!("correlation_registered_total").increment(1);
        Self::record_pending(pending);
    }

    /// Record a resolution.
    pub fn record_resolved(pending: usize) {
        counter!("correlation_resolved_total").increment(1);
        Self::record_pending(pending);
    }

    /// Record a late or duplicate reply.
    pub fn record_discarded() {
        counter!("correlation_discarded_total").increment(1);
    }

    /// Record a timed out wait.
    pub fn record_timeout() {
        counter!("correlation_timeouts_total").increment(1);
    }

    /// Record a cancelled wait.
    pub fn record_cancelled() {
        counter!("correlation_cancelled_total").increment(1);
    }

    /// Record how long a request waited for its reply.
    pub fn record_wait(duration: Duration) {
        histogram!("correlation_wait_duration_seconds").record(duration.as_secs_f64());
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_pending(pending: usize) {
        gauge!("correlation_pending").set(pending as f64);
    }
}

/// Event group metrics recorder.
pub struct AggregationMetrics;

impl AggregationMetrics {
    /// Record a completed aggregation.
    pub fn record_completed(policy: &'static str) {
        counter!("aggregation_completed_total", "policy" => policy).increment(1);
    }

    /// Record a failed aggregation.
    pub fn record_failed() {
        counter!("aggregation_failed_total").increment(1);
    }

    /// Record an expired group.
    pub fn record_expired() {
        counter!("aggregation_expired_total").increment(1);
    }

    /// Record an event for an already processed group.
    pub fn record_missed_reply() {
        counter!("aggregation_missed_replies_total").increment(1);
    }

    /// Record the number of open groups.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_open_groups(open: usize) {
        gauge!("aggregation_open_groups").set(open as f64);
    }
}

/// Queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record an item becoming visible.
    pub fn record_put(queue: &str) {
        counter!("queue_put_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record an item taken.
    pub fn record_take(queue: &str) {
        counter!("queue_take_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a commit.
    pub fn record_commit() {
        counter!("queue_commit_total").increment(1);
    }

    /// Record a rollback.
    pub fn record_rollback() {
        counter!("queue_rollback_total").increment(1);
    }

    /// Record a redelivery.
    pub fn record_redelivery() {
        counter!("queue_redelivery_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a failed attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a sequence that succeeded after at least one failure.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

/// Dead letter queue metrics recorder.
pub struct DlqMetrics;

impl DlqMetrics {
    /// Record an entry pushed, with the resulting size.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pushed(size: usize) {
        counter!("dlq_pushed_total").increment(1);
        gauge!("dlq_size").set(size as f64);
    }

    /// Record an entry dropped to make room.
    pub fn record_dropped() {
        counter!("dlq_dropped_total").increment(1);
    }

    /// Record drained entries.
    pub fn record_drained(count: usize) {
        counter!("dlq_drained_total").increment(count as u64);
        gauge!("dlq_size").set(0.0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        CorrelationMetrics::record_registered(1);
        CorrelationMetrics::record_discarded();
        QueueMetrics::record_put("inbound");

        // Another test may have installed the recorder first
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("correlation_registered_total"));
            assert!(rendered.contains("queue_put_total"));
        }
    }
}
