//! Health reporting for runtime components.
//!
//! Queues, requesters and SEDA services each describe themselves with a
//! [`HealthCheck`]. A [`HealthReport`] folds the checks of a whole context
//! into one verdict, which is the worst individual status.

use serde::Serialize;

/// Verdict of a health check, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Serving normally
    Healthy,

    /// Serving, but close to a limit such as queue capacity
    Degraded,

    /// Not serving: stopped, shut down or full
    Unhealthy,
}

impl HealthStatus {
    /// `true` for [`Healthy`](Self::Healthy).
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// `true` for [`Degraded`](Self::Degraded).
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// `true` for [`Unhealthy`](Self::Unhealthy).
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Combine two verdicts; the more severe one wins.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    /// Verdict for a bounded resource holding `used` of `capacity` slots.
    ///
    /// More than 80% used is degraded; no free slot left is unhealthy.
    #[must_use]
    pub fn from_utilization(used: usize, capacity: usize) -> Self {
        if capacity == 0 || used >= capacity {
            return Self::Unhealthy;
        }
        // used / capacity > 4 / 5 without floating point
        if used.saturating_mul(5) > capacity.saturating_mul(4) {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one component says about itself.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Reporting component, e.g. `queues` or a requester name
    pub component: String,

    /// Its verdict
    pub status: HealthStatus,

    /// Why the verdict is not healthy, when known
    pub message: Option<String>,

    /// Gauges worth showing next to the verdict, such as pending requests
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Check for `component` with `status` and nothing else attached.
    #[must_use]
    pub fn new(component: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            component: component.into(),
            status,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Shorthand for a healthy check.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Healthy)
    }

    /// Degraded check explained by `message`.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Degraded).with_message(message)
    }

    /// Unhealthy check explained by `message`.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Unhealthy).with_message(message)
    }

    /// Replace the explanation.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Append a `key = value` gauge.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }
}

/// Checks of several components and their combined verdict.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status among `checks`; healthy when there are none
    pub status: HealthStatus,

    /// The component checks, in the order given
    pub checks: Vec<HealthCheck>,

    /// Collection time
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Combine `checks`.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Whether every component is healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// The check reported by `component`.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_thresholds() {
        assert_eq!(HealthStatus::from_utilization(0, 10), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_utilization(8, 10), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_utilization(9, 10), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_utilization(10, 10), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from_utilization(0, 0), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_report_takes_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("requester"),
            HealthCheck::degraded("queue:inbound", "90% full"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.check("queue:inbound").is_some());
        assert!(!report.is_healthy());

        let stopped = HealthReport::new(vec![
            HealthCheck::degraded("queue:inbound", "90% full"),
            HealthCheck::unhealthy("queues", "Queue manager is stopped"),
        ]);
        assert!(stopped.status.is_unhealthy());
        assert_eq!(stopped.status.to_string(), "unhealthy");
    }

    #[test]
    fn test_empty_report_is_healthy() {
        assert!(HealthReport::new(Vec::new()).is_healthy());
    }
}
