//! Workflow execution
//!
//! Recovered events are handed to the external workflow executor. The HTTP
//! implementation posts each event to
//! `{executor}/workflows/{workflow_id}/executions` and classifies failures as
//! transient (worth retrying) or permanent.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;
use uuid::Uuid;

use crate::connectors::UpstreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?} execution failure: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: ExecutionErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: ExecutionErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ExecutionErrorKind::Transient
    }

    /// Status classes: 408/429/5xx are transient, every other 4xx is permanent.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("executor responded {}: {}", status, body);
        if status == 408 || status == 429 || status >= 500 {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }
}

/// Request that identifies one replayed event
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest<'a> {
    pub workflow_id: &'a str,
    pub job_id: Uuid,
    pub source: &'static str,
    pub event: &'a UpstreamEvent,
}

#[derive(Debug, Clone, Deserialize)]
struct ExecutionResponse {
    execution_id: String,
}

#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Execute `workflow_id` with the event as trigger; returns the execution id.
    async fn execute(
        &self,
        workflow_id: &str,
        job_id: Uuid,
        event: &UpstreamEvent,
    ) -> Result<String, ExecutionError>;
}

#[derive(Clone)]
pub struct HttpWorkflowExecutor {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpWorkflowExecutor {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        let client = reqwest::Client::builder()
            .user_agent(crate::connectors::http::USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }
}

#[async_trait]
impl WorkflowExecutor for HttpWorkflowExecutor {
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn execute(
        &self,
        workflow_id: &str,
        job_id: Uuid,
        event: &UpstreamEvent,
    ) -> Result<String, ExecutionError> {
        let url = format!(
            "{}/workflows/{}/executions",
            self.base_url.as_str().trim_end_matches('/'),
            workflow_id
        );
        let body = ExecutionRequest {
            workflow_id,
            job_id,
            source: "backfill",
            event,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_builder() {
                ExecutionError::permanent(err.to_string())
            } else {
                ExecutionError::transient(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::from_status(status.as_u16(), &body));
        }

        let parsed: ExecutionResponse = response
            .json()
            .await
            .map_err(|err| ExecutionError::permanent(format!("invalid executor response: {err}")))?;
        debug!(execution_id = %parsed.execution_id, "workflow execution accepted");
        Ok(parsed.execution_id)
    }
}

/// Executor used in local profiles without an executor URL: logs each event
/// and acknowledges it with a synthetic execution id.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl WorkflowExecutor for DryRunExecutor {
    async fn execute(
        &self,
        workflow_id: &str,
        job_id: Uuid,
        event: &UpstreamEvent,
    ) -> Result<String, ExecutionError> {
        info!(
            workflow_id,
            job_id = %job_id,
            event_id = %event.id,
            event_type = %event.event_type,
            "dry-run execution"
        );
        Ok(format!("dry-run-{}", Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ExecutionError::from_status(429, "").is_transient());
        assert!(ExecutionError::from_status(503, "").is_transient());
        assert!(ExecutionError::from_status(408, "").is_transient());
        assert!(!ExecutionError::from_status(400, "").is_transient());
        assert!(!ExecutionError::from_status(404, "").is_transient());
    }

    #[tokio::test]
    async fn dry_run_acknowledges_every_event() {
        let event = UpstreamEvent {
            id: "evt-1".to_string(),
            event_type: "push".to_string(),
            timestamp: chrono::Utc::now(),
            priority: None,
            payload: serde_json::json!({}),
        };
        let execution_id = DryRunExecutor
            .execute("wf-1", Uuid::new_v4(), &event)
            .await
            .unwrap();
        assert!(execution_id.starts_with("dry-run-"));
    }
}
