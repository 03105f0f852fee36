//! Downtime tracking
//!
//! Records outage intervals per (workflow, connector) pair, estimates the
//! events missed while they lasted and schedules recovery jobs when they end.

pub mod detector;
pub mod monitor;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub use detector::{DetectRequest, DowntimeDetector, DowntimeSettings};
pub use monitor::{
    HealthMonitor, HealthProbe, HttpHealthProbe, MonitorStats, ProbeOutcome, WatchTarget,
    cause_for_status,
};

/// Why a pair stopped receiving events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DowntimeCause {
    Maintenance,
    ServerError,
    NetworkFailure,
    RateLimitExceeded,
    EndpointDown,
    ConfigurationError,
    ProviderOutage,
    Unknown,
}

impl DowntimeCause {
    pub const ALL: [DowntimeCause; 8] = [
        DowntimeCause::Maintenance,
        DowntimeCause::ServerError,
        DowntimeCause::NetworkFailure,
        DowntimeCause::RateLimitExceeded,
        DowntimeCause::EndpointDown,
        DowntimeCause::ConfigurationError,
        DowntimeCause::ProviderOutage,
        DowntimeCause::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DowntimeCause::Maintenance => "maintenance",
            DowntimeCause::ServerError => "server_error",
            DowntimeCause::NetworkFailure => "network_failure",
            DowntimeCause::RateLimitExceeded => "rate_limit_exceeded",
            DowntimeCause::EndpointDown => "endpoint_down",
            DowntimeCause::ConfigurationError => "configuration_error",
            DowntimeCause::ProviderOutage => "provider_outage",
            DowntimeCause::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            DowntimeCause::ProviderOutage => Severity::Critical,
            DowntimeCause::ServerError | DowntimeCause::EndpointDown => Severity::High,
            DowntimeCause::NetworkFailure
            | DowntimeCause::RateLimitExceeded
            | DowntimeCause::ConfigurationError
            | DowntimeCause::Unknown => Severity::Medium,
            DowntimeCause::Maintenance => Severity::Low,
        }
    }
}

impl fmt::Display for DowntimeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DowntimeCause {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DowntimeCause::ALL
            .into_iter()
            .find(|cause| cause.as_str() == value)
            .ok_or_else(|| format!("unknown downtime cause '{}'", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|severity| severity.as_str() == value)
            .ok_or_else(|| format!("unknown severity '{}'", value))
    }
}

/// One outage interval of a (workflow, connector) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DowntimeRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub connector_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    /// Absent while the downtime is still open
    pub end_time: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cause: DowntimeCause,
    pub severity: Severity,
    pub estimated_missed_events: u64,
    pub auto_backfill_enabled: bool,
    pub backfill_job_id: Option<Uuid>,
}

impl DowntimeRecord {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Filter for downtime listings
#[derive(Debug, Clone, Default)]
pub struct DowntimeFilter {
    pub workflow_id: Option<String>,
    pub connector_id: Option<String>,
    pub open_only: bool,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

impl DowntimeFilter {
    pub fn matches(&self, record: &DowntimeRecord) -> bool {
        self.workflow_id
            .as_ref()
            .is_none_or(|w| w == &record.workflow_id)
            && self
                .connector_id
                .as_ref()
                .is_none_or(|c| c == &record.connector_id)
            && (!self.open_only || record.is_open())
            && self.started_after.is_none_or(|after| record.start_time >= after)
            && self.started_before.is_none_or(|before| record.start_time < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_cause() {
        assert_eq!(DowntimeCause::ProviderOutage.severity(), Severity::Critical);
        assert_eq!(DowntimeCause::ServerError.severity(), Severity::High);
        assert_eq!(DowntimeCause::EndpointDown.severity(), Severity::High);
        assert_eq!(DowntimeCause::NetworkFailure.severity(), Severity::Medium);
        assert_eq!(DowntimeCause::RateLimitExceeded.severity(), Severity::Medium);
        assert_eq!(DowntimeCause::ConfigurationError.severity(), Severity::Medium);
        assert_eq!(DowntimeCause::Unknown.severity(), Severity::Medium);
        assert_eq!(DowntimeCause::Maintenance.severity(), Severity::Low);
    }

    #[test]
    fn causes_parse_from_snake_case() {
        for cause in DowntimeCause::ALL {
            assert_eq!(cause.as_str().parse::<DowntimeCause>().unwrap(), cause);
        }
    }
}
