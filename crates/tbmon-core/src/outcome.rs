//! Delivery outcomes
//!
//! Every device tick ends in exactly one `DeliveryOutcome` per reading. The
//! outcome is what gets logged and counted; nothing else escapes a tick.

use std::fmt;

/// Result of one delivery attempt for a reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Published to the server
    Delivered,

    /// Durably written to the local cache
    Cached,

    /// Cached, then at least one pending entry was flushed to the server
    CachedAndForwarded { flushed: usize },

    /// Nothing to deliver this tick
    Skipped(SkipReason),

    /// The reading was not delivered and not cached
    Failed(FailureReason),
}

impl DeliveryOutcome {
    /// True if the reading reached the server or the cache
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Delivered
                | DeliveryOutcome::Cached
                | DeliveryOutcome::CachedAndForwarded { .. }
        )
    }

    /// True for outcomes that must be logged at error severity
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Failed(FailureReason::Dropped(_))
                | DeliveryOutcome::Failed(FailureReason::Rejected { .. })
                | DeliveryOutcome::Failed(FailureReason::Cache(_))
        )
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Delivered => write!(f, "delivered"),
            DeliveryOutcome::Cached => write!(f, "cached"),
            DeliveryOutcome::CachedAndForwarded { flushed } => {
                write!(f, "cached and forwarded ({} flushed)", flushed)
            }
            DeliveryOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            DeliveryOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Why a tick produced nothing to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Device has `active` unset
    Inactive,

    /// The sensor could not be read
    SourceUnavailable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Inactive => write!(f, "inactive"),
            SkipReason::SourceUnavailable(detail) => write!(f, "source unavailable: {}", detail),
        }
    }
}

/// Why a reading was neither delivered nor cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// An older cached entry failed to replay; the device backs off until the
    /// next tick
    ReplayRetryPending,

    /// Retryable publish failure with caching disabled; the reading is lost
    Dropped(String),

    /// The server refused the payload; never retried
    Rejected { status: u16, message: String },

    /// The cache could not persist the reading
    Cache(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ReplayRetryPending => write!(f, "replay retry pending"),
            FailureReason::Dropped(detail) => write!(f, "dropped: {}", detail),
            FailureReason::Rejected { status, message } => {
                write!(f, "rejected ({}): {}", status, message)
            }
            FailureReason::Cache(detail) => write!(f, "cache error: {}", detail),
        }
    }
}

/// Everything that happened for one device in one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Device fingerprint
    pub device: String,

    /// Outcome for the device's own telemetry reading
    pub telemetry: DeliveryOutcome,

    /// Outcome for host metrics, when `sys_info` is set
    pub host: Option<DeliveryOutcome>,

    /// Outcome of the attribute publish, when one was attempted
    pub attributes: Option<DeliveryOutcome>,

    /// Cached entries published from the cache this tick
    pub replayed: usize,
}

impl TickReport {
    pub fn new(device: impl Into<String>, telemetry: DeliveryOutcome) -> Self {
        Self {
            device: device.into(),
            telemetry,
            host: None,
            attributes: None,
            replayed: 0,
        }
    }

    /// All outcomes recorded in this report
    pub fn outcomes(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        std::iter::once(&self.telemetry)
            .chain(self.host.iter())
            .chain(self.attributes.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_outcomes() {
        assert!(DeliveryOutcome::Delivered.is_durable());
        assert!(DeliveryOutcome::Cached.is_durable());
        assert!(DeliveryOutcome::CachedAndForwarded { flushed: 2 }.is_durable());
        assert!(!DeliveryOutcome::Skipped(SkipReason::Inactive).is_durable());
        assert!(!DeliveryOutcome::Failed(FailureReason::ReplayRetryPending).is_durable());
    }

    #[test]
    fn test_error_outcomes() {
        assert!(DeliveryOutcome::Failed(FailureReason::Dropped("timeout".into())).is_error());
        assert!(DeliveryOutcome::Failed(FailureReason::Rejected {
            status: 401,
            message: "bad key".into()
        })
        .is_error());
        assert!(!DeliveryOutcome::Failed(FailureReason::ReplayRetryPending).is_error());
        assert!(!DeliveryOutcome::Cached.is_error());
    }

    #[test]
    fn test_display() {
        let outcome = DeliveryOutcome::Failed(FailureReason::Rejected {
            status: 400,
            message: "malformed".into(),
        });
        assert_eq!(outcome.to_string(), "failed: rejected (400): malformed");
        assert_eq!(
            DeliveryOutcome::Skipped(SkipReason::Inactive).to_string(),
            "skipped: inactive"
        );
    }

    #[test]
    fn test_report_outcomes() {
        let mut report = TickReport::new("abc", DeliveryOutcome::Delivered);
        assert_eq!(report.outcomes().count(), 1);

        report.host = Some(DeliveryOutcome::Cached);
        report.attributes = Some(DeliveryOutcome::Delivered);
        assert_eq!(report.outcomes().count(), 3);
    }
}
