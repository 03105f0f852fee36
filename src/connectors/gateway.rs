//! Connector gateway event source
//!
//! Generic HTTP event source for connectors whose upstream APIs are fronted by
//! the connector gateway. Every fetch is a `GET` against
//! `{gateway}/connectors/{id}{endpoint}` with `since`/`until` bounds and an
//! optional `cursor`/`limit`, answered with `{ "events": [...], "next_cursor": ... }`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::backfill::types::TimeWindow;
use crate::connectors::http::{USER_AGENT, error_from_response};
use crate::connectors::{
    ConnectorEndpoints, ConnectorError, Cursor, EventPage, EventSource, UpstreamEvent,
};

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    events: Vec<UpstreamEvent>,
    #[serde(default)]
    next_cursor: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct GatewayEventSource {
    client: reqwest::Client,
    base_url: Url,
    connector_id: String,
    endpoints: ConnectorEndpoints,
    token: Option<String>,
}

impl GatewayEventSource {
    pub fn new(
        base_url: &str,
        connector_id: &str,
        endpoints: ConnectorEndpoints,
        token: Option<String>,
    ) -> Result<Self, ConnectorError> {
        let base_url = Url::parse(base_url).map_err(|err| ConnectorError::ConfigurationError {
            details: format!("invalid gateway url '{}': {}", base_url, err),
        })?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(ConnectorError::from)?;

        Ok(Self {
            client,
            base_url,
            connector_id: connector_id.to_string(),
            endpoints,
            token,
        })
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, ConnectorError> {
        let raw = format!(
            "{}/connectors/{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.connector_id,
            endpoint
        );
        Url::parse(&raw).map_err(|err| ConnectorError::ConfigurationError {
            details: format!("invalid endpoint url '{}': {}", raw, err),
        })
    }

    async fn get(
        &self,
        endpoint: &str,
        window: &TimeWindow,
        cursor: Option<&Cursor>,
        limit: Option<u32>,
    ) -> Result<GatewayResponse, ConnectorError> {
        let mut url = self.endpoint_url(endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("since", &window.start.to_rfc3339())
                .append_pair("until", &window.end.to_rfc3339());
            if let Some(cursor) = cursor {
                let value = match cursor.as_str() {
                    Some(text) => text.to_string(),
                    None => cursor.as_json().to_string(),
                };
                query.append_pair("cursor", &value);
            }
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
        }

        let mut request = self.client.get(url).header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(&self.connector_id, response).await);
        }

        response
            .json::<GatewayResponse>()
            .await
            .map_err(|err| ConnectorError::MalformedResponse {
                details: err.to_string(),
            })
    }
}

#[async_trait]
impl EventSource for GatewayEventSource {
    #[instrument(skip(self), fields(connector = %self.connector_id))]
    async fn poll_range(&self, window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        let response = self.get(&self.endpoints.poll, window, None, None).await?;
        debug!(count = response.events.len(), "polled events");
        Ok(response.events)
    }

    #[instrument(skip(self), fields(connector = %self.connector_id))]
    async fn fetch_event_log(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        let Some(endpoint) = self.endpoints.event_log.as_deref() else {
            return Err(ConnectorError::EventLogUnavailable {
                connector: self.connector_id.clone(),
            });
        };

        match self.get(endpoint, window, None, None).await {
            Ok(response) => Ok(response.events),
            Err(ConnectorError::HttpError { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Err(ConnectorError::EventLogUnavailable {
                    connector: self.connector_id.clone(),
                })
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self, cursor), fields(connector = %self.connector_id))]
    async fn fetch_page(
        &self,
        window: &TimeWindow,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> Result<EventPage, ConnectorError> {
        let Some(endpoint) = self.endpoints.page.as_deref() else {
            return Err(ConnectorError::ConfigurationError {
                details: format!(
                    "connector '{}' does not support cursor pagination",
                    self.connector_id
                ),
            });
        };

        let response = self.get(endpoint, window, cursor, Some(limit)).await?;
        let next_cursor = response
            .next_cursor
            .filter(|value| !value.is_null())
            .map(Cursor::from_json);

        Ok(EventPage {
            events: response.events,
            next_cursor,
        })
    }

    #[instrument(skip(self), fields(connector = %self.connector_id))]
    async fn list_events(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        let response = self.get(&self.endpoints.list, window, None, None).await?;
        Ok(response
            .events
            .into_iter()
            .filter(|event| window.contains(event.timestamp))
            .collect())
    }
}
