//! Connector registry
//!
//! In-memory registry of connector capabilities and the event sources that
//! serve them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::connectors::{
    ConnectorCapability, EventSource, GatewayEventSource, GitHubEventSource, builtin_catalog,
};

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Connector '{name}' not found")]
    ConnectorNotFound { name: String },
    #[error("Connector '{name}' has no configured event source")]
    SourceNotConfigured { name: String },
}

#[derive(Clone)]
struct Entry {
    capability: ConnectorCapability,
    source: Option<Arc<dyn EventSource>>,
}

/// Registry of connector capabilities and their event sources
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    entries: HashMap<String, Entry>,
}

impl ConnectorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the built-in catalogue, wiring event sources
    /// for every connector the configuration can reach.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();

        for capability in builtin_catalog() {
            let source: Option<Arc<dyn EventSource>> = if capability.id == "github" {
                github_source(config)
            } else {
                gateway_source(config, &capability)
            };
            registry.register(capability, source);
        }

        let wired = registry
            .entries
            .values()
            .filter(|entry| entry.source.is_some())
            .count();
        info!(
            connectors = registry.entries.len(),
            sources = wired,
            "connector registry initialised"
        );

        registry
    }

    /// Register (or replace) a connector
    pub fn register(
        &mut self,
        capability: ConnectorCapability,
        source: Option<Arc<dyn EventSource>>,
    ) {
        self.entries
            .insert(capability.id.clone(), Entry { capability, source });
    }

    pub fn capability(&self, name: &str) -> Result<&ConnectorCapability, RegistryError> {
        self.entries
            .get(name)
            .map(|entry| &entry.capability)
            .ok_or_else(|| RegistryError::ConnectorNotFound {
                name: name.to_string(),
            })
    }

    pub fn source(&self, name: &str) -> Result<Arc<dyn EventSource>, RegistryError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::ConnectorNotFound {
                name: name.to_string(),
            })?;
        entry
            .source
            .clone()
            .ok_or_else(|| RegistryError::SourceNotConfigured {
                name: name.to_string(),
            })
    }

    /// A connector is startable only when flagged supported and backed by a source.
    pub fn is_supported(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.capability.supported && entry.source.is_some())
    }

    /// Capabilities sorted by id for stable ordering
    pub fn list(&self) -> Vec<ConnectorCapability> {
        let mut capabilities: Vec<_> = self
            .entries
            .values()
            .map(|entry| entry.capability.clone())
            .collect();
        capabilities.sort_by(|a, b| a.id.cmp(&b.id));
        capabilities
    }
}

fn github_source(config: &AppConfig) -> Option<Arc<dyn EventSource>> {
    let Some(scope) = config.github_events_scope.clone() else {
        warn!("GitHub event source not registered: missing events scope");
        return None;
    };
    match GitHubEventSource::new(&config.github_api_base, config.github_token.clone(), scope) {
        Ok(source) => Some(Arc::new(source)),
        Err(err) => {
            warn!(error = %err, "GitHub event source not registered");
            None
        }
    }
}

fn gateway_source(
    config: &AppConfig,
    capability: &ConnectorCapability,
) -> Option<Arc<dyn EventSource>> {
    let base_url = config.connector_gateway_url.as_deref()?;
    match GatewayEventSource::new(
        base_url,
        &capability.id,
        capability.endpoints.clone(),
        config.connector_gateway_token.clone(),
    ) {
        Ok(source) => Some(Arc::new(source)),
        Err(err) => {
            warn!(connector = %capability.id, error = %err, "gateway event source not registered");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::types::TimeWindow;
    use crate::connectors::{ConnectorError, Cursor, EventPage, UpstreamEvent};
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl EventSource for EmptySource {
        async fn poll_range(&self, _: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
            Ok(vec![])
        }

        async fn fetch_event_log(
            &self,
            _: &TimeWindow,
        ) -> Result<Vec<UpstreamEvent>, ConnectorError> {
            Ok(vec![])
        }

        async fn fetch_page(
            &self,
            _: &TimeWindow,
            _: Option<&Cursor>,
            _: u32,
        ) -> Result<EventPage, ConnectorError> {
            Ok(EventPage::default())
        }

        async fn list_events(&self, _: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
            Ok(vec![])
        }
    }

    fn capability(id: &str, supported: bool) -> ConnectorCapability {
        let mut capability = builtin_catalog().remove(0);
        capability.id = id.to_string();
        capability.supported = supported;
        capability
    }

    #[test]
    fn unknown_connector_is_reported() {
        let registry = ConnectorRegistry::new();
        match registry.capability("unknown") {
            Err(RegistryError::ConnectorNotFound { name }) => assert_eq!(name, "unknown"),
            _ => panic!("expected ConnectorNotFound"),
        }
        assert!(!registry.is_supported("unknown"));
    }

    #[test]
    fn support_requires_flag_and_source() {
        let mut registry = ConnectorRegistry::new();
        registry.register(capability("wired", true), Some(Arc::new(EmptySource)));
        registry.register(capability("unwired", true), None);
        registry.register(capability("disabled", false), Some(Arc::new(EmptySource)));

        assert!(registry.is_supported("wired"));
        assert!(!registry.is_supported("unwired"));
        assert!(!registry.is_supported("disabled"));
        assert!(matches!(
            registry.source("unwired"),
            Err(RegistryError::SourceNotConfigured { .. })
        ));
    }

    #[test]
    fn list_is_sorted_by_id() {
        let mut registry = ConnectorRegistry::new();
        registry.register(capability("zebra", true), None);
        registry.register(capability("apple", true), None);
        registry.register(capability("mango", true), None);

        let ids: Vec<_> = registry.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn default_config_registers_catalogue_without_sources() {
        let registry = ConnectorRegistry::from_config(&AppConfig::default());
        assert_eq!(registry.list().len(), builtin_catalog().len());
        assert!(!registry.is_supported("stripe"));
    }
}
