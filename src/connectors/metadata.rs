//! Connector capability metadata
//!
//! Static description of what each upstream connector can do for recovery:
//! which strategies it supports, how far back it can reach and how fast it
//! may be called.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::backfill::types::{BackfillStrategy, TimeWindow};

/// Events per hour assumed for connectors without a catalogue entry
pub const DEFAULT_ACTIVITY_RATE_PER_HOUR: f64 = 10.0;

/// Authentication type used by the connector's upstream API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    OAuth2,
    ApiKey,
    Basic,
    Bearer,
}

/// Upstream request budget
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: Option<u32>,
}

/// Relative paths of the fetch endpoints exposed for this connector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConnectorEndpoints {
    pub poll: String,
    pub list: String,
    pub page: Option<String>,
    pub event_log: Option<String>,
    pub health: Option<String>,
}

impl ConnectorEndpoints {
    fn standard(cursor: bool, event_log: bool) -> Self {
        Self {
            poll: "/events".to_string(),
            list: "/events/search".to_string(),
            page: cursor.then(|| "/events/page".to_string()),
            event_log: event_log.then(|| "/event-log".to_string()),
            health: Some("/health".to_string()),
        }
    }
}

/// Capability record of one connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConnectorCapability {
    pub id: String,
    pub display_name: String,
    /// Jobs may only be started for supported connectors
    pub supported: bool,
    pub supported_strategies: Vec<BackfillStrategy>,
    pub timestamp_filtering: bool,
    pub cursor_pagination: bool,
    pub event_log: bool,
    pub max_lookback_hours: u32,
    pub rate_limits: RateLimits,
    pub activity_rate_per_hour: f64,
    pub auth_type: AuthType,
    pub endpoints: ConnectorEndpoints,
}

impl ConnectorCapability {
    pub fn supports(&self, strategy: BackfillStrategy) -> bool {
        self.supported_strategies.contains(&strategy)
    }

    /// Expected number of events inside `window`, rounded up.
    pub fn estimate_events(&self, window: &TimeWindow) -> u64 {
        estimate_events(self.activity_rate_per_hour, window)
    }
}

/// `ceil(hours × rate)`; zero for empty or inverted windows.
pub fn estimate_events(activity_rate_per_hour: f64, window: &TimeWindow) -> u64 {
    let estimate = (window.hours() * activity_rate_per_hour).ceil();
    if estimate.is_finite() && estimate > 0.0 {
        estimate as u64
    } else {
        0
    }
}

struct CatalogEntry {
    id: &'static str,
    display_name: &'static str,
    supported: bool,
    timestamp_filtering: bool,
    cursor_pagination: bool,
    event_log: bool,
    max_lookback_hours: u32,
    per_minute: u32,
    per_hour: u32,
    per_day: Option<u32>,
    activity_rate_per_hour: f64,
    auth_type: AuthType,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "github",
        display_name: "GitHub",
        supported: true,
        timestamp_filtering: false,
        cursor_pagination: true,
        event_log: true,
        max_lookback_hours: 2_160,
        per_minute: 80,
        per_hour: 5_000,
        per_day: None,
        activity_rate_per_hour: 50.0,
        auth_type: AuthType::Bearer,
    },
    CatalogEntry {
        id: "gitlab",
        display_name: "GitLab",
        supported: true,
        timestamp_filtering: true,
        cursor_pagination: true,
        event_log: true,
        max_lookback_hours: 720,
        per_minute: 300,
        per_hour: 2_000,
        per_day: None,
        activity_rate_per_hour: 30.0,
        auth_type: AuthType::Bearer,
    },
    CatalogEntry {
        id: "stripe",
        display_name: "Stripe",
        supported: true,
        timestamp_filtering: true,
        cursor_pagination: true,
        event_log: true,
        max_lookback_hours: 720,
        per_minute: 100,
        per_hour: 6_000,
        per_day: None,
        activity_rate_per_hour: 100.0,
        auth_type: AuthType::ApiKey,
    },
    CatalogEntry {
        id: "shopify",
        display_name: "Shopify",
        supported: true,
        timestamp_filtering: true,
        cursor_pagination: true,
        event_log: false,
        max_lookback_hours: 1_440,
        per_minute: 40,
        per_hour: 2_400,
        per_day: None,
        activity_rate_per_hour: 80.0,
        auth_type: AuthType::OAuth2,
    },
    CatalogEntry {
        id: "slack",
        display_name: "Slack",
        supported: true,
        timestamp_filtering: true,
        cursor_pagination: true,
        event_log: false,
        max_lookback_hours: 168,
        per_minute: 50,
        per_hour: 3_000,
        per_day: None,
        activity_rate_per_hour: 200.0,
        auth_type: AuthType::OAuth2,
    },
    CatalogEntry {
        id: "hubspot",
        display_name: "HubSpot",
        supported: true,
        timestamp_filtering: true,
        cursor_pagination: true,
        event_log: false,
        max_lookback_hours: 720,
        per_minute: 100,
        per_hour: 4_000,
        per_day: Some(250_000),
        activity_rate_per_hour: 40.0,
        auth_type: AuthType::OAuth2,
    },
    CatalogEntry {
        id: "salesforce",
        display_name: "Salesforce",
        supported: true,
        timestamp_filtering: true,
        cursor_pagination: false,
        event_log: true,
        max_lookback_hours: 720,
        per_minute: 100,
        per_hour: 5_000,
        per_day: Some(100_000),
        activity_rate_per_hour: 60.0,
        auth_type: AuthType::OAuth2,
    },
    CatalogEntry {
        id: "typeform",
        display_name: "Typeform",
        supported: true,
        timestamp_filtering: true,
        cursor_pagination: false,
        event_log: false,
        max_lookback_hours: 720,
        per_minute: 120,
        per_hour: 2_000,
        per_day: None,
        activity_rate_per_hour: 5.0,
        auth_type: AuthType::Bearer,
    },
    CatalogEntry {
        id: "discord",
        display_name: "Discord",
        supported: false,
        timestamp_filtering: false,
        cursor_pagination: true,
        event_log: false,
        max_lookback_hours: 24,
        per_minute: 50,
        per_hour: 3_000,
        per_day: None,
        activity_rate_per_hour: 150.0,
        auth_type: AuthType::Bearer,
    },
];

impl From<&CatalogEntry> for ConnectorCapability {
    fn from(entry: &CatalogEntry) -> Self {
        let mut strategies = vec![BackfillStrategy::ApiPolling, BackfillStrategy::TimestampScan];
        if entry.cursor_pagination {
            strategies.push(BackfillStrategy::CursorBased);
        }
        if entry.event_log {
            strategies.push(BackfillStrategy::EventLogReplay);
            strategies.push(BackfillStrategy::Hybrid);
        }

        ConnectorCapability {
            id: entry.id.to_string(),
            display_name: entry.display_name.to_string(),
            supported: entry.supported,
            supported_strategies: strategies,
            timestamp_filtering: entry.timestamp_filtering,
            cursor_pagination: entry.cursor_pagination,
            event_log: entry.event_log,
            max_lookback_hours: entry.max_lookback_hours,
            rate_limits: RateLimits {
                requests_per_minute: entry.per_minute,
                requests_per_hour: entry.per_hour,
                requests_per_day: entry.per_day,
            },
            activity_rate_per_hour: entry.activity_rate_per_hour,
            auth_type: entry.auth_type.clone(),
            endpoints: ConnectorEndpoints::standard(entry.cursor_pagination, entry.event_log),
        }
    }
}

/// Built-in connector catalogue, in declaration order
pub fn builtin_catalog() -> Vec<ConnectorCapability> {
    CATALOG.iter().map(ConnectorCapability::from).collect()
}
