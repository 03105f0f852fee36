//! Connectors module
//!
//! This module provides the connector layer used by recovery jobs:
//! - The `EventSource` trait defining the fetch operations strategies rely on
//! - Capability metadata and the registry for discovery and lookup
//! - The generic gateway source and the GitHub Events API source

pub mod gateway;
pub mod github;
pub(crate) mod http;
pub mod metadata;
pub mod registry;
pub mod trait_;

pub use gateway::GatewayEventSource;
pub use github::GitHubEventSource;
pub use metadata::{
    AuthType, ConnectorCapability, ConnectorEndpoints, DEFAULT_ACTIVITY_RATE_PER_HOUR, RateLimits,
    builtin_catalog, estimate_events,
};
pub use registry::{ConnectorRegistry, RegistryError};
pub use trait_::{ConnectorError, Cursor, EventPage, EventSource, UpstreamEvent};
