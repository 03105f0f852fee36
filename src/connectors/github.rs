//! GitHub event source
//!
//! Reads the GitHub Events API (`/repos/{owner}/{repo}/events`,
//! `/orgs/{org}/events`, ...). The API returns events newest first, offers no
//! server-side time filter and paginates through `Link` headers, so window
//! bounds are applied client-side and scanning stops once a page reaches
//! events older than the window start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::backfill::types::TimeWindow;
use crate::connectors::http::{USER_AGENT, error_from_response, header_u64};
use crate::connectors::{ConnectorError, Cursor, EventPage, EventSource, UpstreamEvent};

/// GitHub serves at most ten pages of events per feed
const MAX_PAGES: usize = 10;
const MAX_PER_PAGE: u32 = 100;
const LOW_RATE_LIMIT_THRESHOLD: u64 = 100;

#[derive(Debug, Deserialize)]
struct GitHubEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

impl From<GitHubEvent> for UpstreamEvent {
    fn from(event: GitHubEvent) -> Self {
        let mut payload = event.rest;
        payload.insert("id".to_string(), serde_json::json!(event.id));
        payload.insert("type".to_string(), serde_json::json!(event.event_type));
        payload.insert(
            "created_at".to_string(),
            serde_json::json!(event.created_at.to_rfc3339()),
        );

        UpstreamEvent {
            id: event.id,
            timestamp: event.created_at,
            event_type: event.event_type,
            priority: None,
            payload: serde_json::Value::Object(payload),
        }
    }
}

struct FetchedPage {
    events: Vec<UpstreamEvent>,
    next: Option<String>,
}

#[derive(Clone)]
pub struct GitHubEventSource {
    client: reqwest::Client,
    api_base: Url,
    token: Option<String>,
    /// Feed path such as `repos/acme/app`
    scope: String,
}

impl GitHubEventSource {
    pub fn new(api_base: &str, token: Option<String>, scope: String) -> Result<Self, ConnectorError> {
        let api_base = Url::parse(api_base).map_err(|err| ConnectorError::ConfigurationError {
            details: format!("invalid GitHub API base '{}': {}", api_base, err),
        })?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(ConnectorError::from)?;

        Ok(Self {
            client,
            api_base,
            token,
            scope: scope.trim_matches('/').to_string(),
        })
    }

    fn first_page_url(&self, per_page: u32) -> Result<Url, ConnectorError> {
        let raw = format!(
            "{}/{}/events",
            self.api_base.as_str().trim_end_matches('/'),
            self.scope
        );
        let mut url = Url::parse(&raw).map_err(|err| ConnectorError::ConfigurationError {
            details: format!("invalid events url '{}': {}", raw, err),
        })?;
        url.query_pairs_mut()
            .append_pair("per_page", &per_page.clamp(1, MAX_PER_PAGE).to_string());
        Ok(url)
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ConnectorError> {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response("github", response).await);
        }

        if let Some(remaining) = header_u64(response.headers(), "X-RateLimit-Remaining")
            && remaining < LOW_RATE_LIMIT_THRESHOLD
        {
            warn!(remaining, "GitHub API rate limit running low");
        }

        let next = response
            .headers()
            .get("Link")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_next_link);

        let events: Vec<GitHubEvent> =
            response
                .json()
                .await
                .map_err(|err| ConnectorError::MalformedResponse {
                    details: err.to_string(),
                })?;

        Ok(FetchedPage {
            events: events.into_iter().map(UpstreamEvent::from).collect(),
            next,
        })
    }

    /// Walk the feed until it is exhausted or older than `window.start`,
    /// returning in-window events oldest first.
    async fn scan(&self, window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        let mut url = self.first_page_url(MAX_PER_PAGE)?.to_string();
        let mut collected = Vec::new();

        for page_number in 1..=MAX_PAGES {
            let page = self.fetch(&url).await?;
            let passed_window = reaches_before(&page.events, window);
            collected.extend(
                page.events
                    .into_iter()
                    .filter(|event| window.contains(event.timestamp)),
            );

            debug!(page = page_number, collected = collected.len(), "scanned GitHub events page");

            match page.next {
                Some(next) if !passed_window => url = next,
                _ => break,
            }
        }

        collected.sort_by_key(|event| event.timestamp);
        Ok(collected)
    }
}

fn reaches_before(events: &[UpstreamEvent], window: &TimeWindow) -> bool {
    events.iter().any(|event| event.timestamp < window.start)
}

/// Extract the `rel="next"` target from a GitHub `Link` header.
fn parse_next_link(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let url_part = parts.next()?.trim();
        let is_next = parts.any(|part| part.trim() == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let (target, _) = url_part.strip_prefix('<')?.split_once('>')?;
        (!target.is_empty()).then(|| target.to_string())
    })
}

#[async_trait]
impl EventSource for GitHubEventSource {
    #[instrument(skip(self), fields(scope = %self.scope))]
    async fn poll_range(&self, window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        self.scan(window).await
    }

    #[instrument(skip(self), fields(scope = %self.scope))]
    async fn fetch_event_log(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        self.scan(window).await
    }

    #[instrument(skip(self, cursor), fields(scope = %self.scope))]
    async fn fetch_page(
        &self,
        window: &TimeWindow,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> Result<EventPage, ConnectorError> {
        let url = match cursor {
            Some(cursor) => cursor
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ConnectorError::ConfigurationError {
                    details: "GitHub cursors must be page URLs".to_string(),
                })?,
            None => self.first_page_url(limit)?.to_string(),
        };

        let page = self.fetch(&url).await?;
        let passed_window = reaches_before(&page.events, window);
        let mut events: Vec<_> = page
            .events
            .into_iter()
            .filter(|event| window.contains(event.timestamp))
            .collect();
        events.sort_by_key(|event| event.timestamp);

        Ok(EventPage {
            events,
            next_cursor: page
                .next
                .filter(|_| !passed_window)
                .map(Cursor::from_string),
        })
    }

    #[instrument(skip(self), fields(scope = %self.scope))]
    async fn list_events(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        self.scan(window).await
    }
}
