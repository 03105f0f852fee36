//! End-to-end tests for the HTTP API over a real listener

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use webhook_backfill::backfill::{BackfillStore, JobStatus, MemoryStore, TimeWindow};
use webhook_backfill::config::AppConfig;
use webhook_backfill::connectors::EventSource;
use webhook_backfill::server::{AppState, create_app};

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::{
    OPERATOR_TOKEN, StaticEventSource, TestApp, capability, hours_ago, spread_events, test_app,
    test_config, wait_until_settled,
};

struct TestServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<AnyhowResult<()>>>,
}

impl TestServerHandle {
    async fn shutdown(mut self) -> AnyhowResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join_handle.take() {
            handle.await.context("server task join failed")??;
        }
        Ok(())
    }
}

impl Drop for TestServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn spawn_server(state: AppState) -> (String, TestServerHandle) {
    let app = create_app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_url = format!("http://{}", listener.local_addr().unwrap());

    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = ready_tx.send(());
        server.await.context("axum server error")
    });
    ready_rx.await.expect("server task to signal readiness");

    (
        server_url,
        TestServerHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
        },
    )
}

/// Server with stripe backed by `events` (optionally slowed down).
async fn spawn_app(
    config: AppConfig,
    events: usize,
    latency: Duration,
) -> (String, TestApp, TestServerHandle) {
    let window = TimeWindow::new(hours_ago(3), hours_ago(1));
    let source: Arc<dyn EventSource> =
        Arc::new(StaticEventSource::new(spread_events(&window, events)).with_latency(latency));
    let store: Arc<dyn BackfillStore> = Arc::new(MemoryStore::new());
    let app = test_app(config, store, vec![(capability("stripe"), source)]);
    let (url, handle) = spawn_server(app.state.clone()).await;
    (url, app, handle)
}

fn authed(builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    builder
        .header("Authorization", format!("Bearer {}", OPERATOR_TOKEN))
        .header("X-User-Id", "ops-user")
}

fn job_body(connector_id: &str, start: bool) -> Value {
    json!({
        "connector_id": connector_id,
        "workflow_id": "wf-orders",
        "start_time": hours_ago(3).to_rfc3339(),
        "end_time": hours_ago(1).to_rfc3339(),
        "start": start
    })
}

#[tokio::test]
async fn public_endpoints_need_no_token() {
    let (url, _app, handle) = spawn_app(test_config(), 0, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/healthz", url)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let response = client.get(format!("{}/", url)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client.get(format!("{}/openapi.json", url)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let openapi: Value = response.json().await.unwrap();
    assert!(openapi["paths"]["/v1/backfill/jobs"].is_object());
    assert!(openapi["paths"]["/v1/downtime/{id}/resolve"].is_object());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn protected_endpoints_require_operator_and_user() {
    let (url, _app, handle) = spawn_app(test_config(), 0, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/v1/backfill/jobs", url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");

    let response = client
        .get(format!("{}/v1/backfill/jobs", url))
        .header("Authorization", "Bearer not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(format!("{}/v1/backfill/jobs", url))
        .header("Authorization", format!("Basic {}", OPERATOR_TOKEN))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Mutations act on behalf of a user
    let response = client
        .post(format!("{}/v1/backfill/jobs", url))
        .header("Authorization", format!("Bearer {}", OPERATOR_TOKEN))
        .json(&job_body("stripe", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers()["content-type"],
        "application/problem+json"
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn job_lifecycle_over_http() {
    let (url, app, handle) = spawn_app(test_config(), 8, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = authed(client.post(format!("{}/v1/backfill/jobs", url)))
        .json(&job_body("stripe", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let job: Value = response.json().await.unwrap();
    assert_eq!(job["status"], "pending");
    assert_eq!(job["strategy"], "cursor_based");
    assert_eq!(job["user_id"], "ops-user");
    let id = job["id"].as_str().unwrap().to_string();

    // Pausing a job that never started is a conflict
    let response = authed(client.post(format!("{}/v1/backfill/jobs/{}/pause", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "CONFLICT");

    let response = authed(client.post(format!("{}/v1/backfill/jobs/{}/start", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let job_id = id.parse().unwrap();
    let settled = wait_until_settled(&app.state.manager, job_id).await;
    assert_eq!(settled.status, JobStatus::Completed);
    assert_eq!(app.executor.delivered().len(), 8);

    let response = authed(client.get(format!("{}/v1/backfill/jobs/{}", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job: Value = response.json().await.unwrap();
    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress"]["successful"], 8);

    let response = authed(client.get(format!("{}/v1/backfill/jobs/{}/events?limit=5", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events: Value = response.json().await.unwrap();
    assert_eq!(events["events"].as_array().unwrap().len(), 5);

    let response = authed(client.get(format!(
        "{}/v1/backfill/jobs?status=completed&connector_id=stripe",
        url
    )))
    .send()
    .await
    .unwrap();
    let listed: Value = response.json().await.unwrap();
    assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn job_errors_map_to_problem_responses() {
    let (url, _app, handle) = spawn_app(test_config(), 0, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = authed(client.get(format!(
        "{}/v1/backfill/jobs/00000000-0000-0000-0000-000000000000",
        url
    )))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = authed(client.post(format!("{}/v1/backfill/jobs", url)))
        .json(&job_body("discord", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let mut inverted = job_body("stripe", false);
    inverted["start_time"] = json!(hours_ago(1).to_rfc3339());
    inverted["end_time"] = json!(hours_ago(3).to_rfc3339());
    let response = authed(client.post(format!("{}/v1/backfill/jobs", url)))
        .json(&inverted)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = authed(client.post(format!("{}/v1/backfill/jobs", url)))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = authed(client.get(format!("{}/v1/backfill/jobs?status=sleeping", url)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn full_engine_answers_with_retry_after() {
    let mut config = test_config();
    config.engine.max_concurrent_jobs = 1;
    config.engine.processor_tick_seconds = 7;
    let (url, app, handle) = spawn_app(config, 4, Duration::from_secs(1)).await;
    let client = reqwest::Client::new();

    let response = authed(client.post(format!("{}/v1/backfill/jobs", url)))
        .json(&job_body("stripe", true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let running: Value = response.json().await.unwrap();
    assert_eq!(running["status"], "running");

    let response = authed(client.post(format!("{}/v1/backfill/jobs", url)))
        .json(&job_body("stripe", true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "7");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "CONCURRENCY_LIMIT");
    assert_eq!(body["retry_after"], 7);

    let id = running["id"].as_str().unwrap();
    let response = authed(client.post(format!("{}/v1/backfill/jobs/{}/cancel", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let settled = wait_until_settled(&app.state.manager, id.parse().unwrap()).await;
    assert_eq!(settled.status, JobStatus::Cancelled);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn connector_catalogue_is_browsable() {
    let (url, _app, handle) = spawn_app(test_config(), 0, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = authed(client.get(format!("{}/v1/backfill/connectors", url)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    let connectors = body["connectors"].as_array().unwrap();
    let stripe = connectors.iter().find(|c| c["id"] == "stripe").unwrap();
    assert_eq!(stripe["startable"], true);
    let discord = connectors.iter().find(|c| c["id"] == "discord").unwrap();
    assert_eq!(discord["startable"], false);

    let response = authed(client.get(format!("{}/v1/backfill/connectors/stripe", url)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = authed(client.get(format!("{}/v1/backfill/connectors/myspace", url)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn downtime_endpoints_round_trip() {
    let (url, app, handle) = spawn_app(test_config(), 0, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = authed(client.post(format!("{}/v1/downtime", url)))
        .json(&json!({
            "workflow_id": "wf-orders",
            "connector_id": "stripe",
            "cause": "server_error",
            "started_at": hours_ago(2).to_rfc3339(),
            "auto_backfill": false
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let record: Value = response.json().await.unwrap();
    assert_eq!(record["user_id"], "ops-user");
    assert!(record["end_time"].is_null());
    let id = record["id"].as_str().unwrap().to_string();

    let response = authed(client.get(format!("{}/v1/downtime?open=true", url)))
        .send()
        .await
        .unwrap();
    let listed: Value = response.json().await.unwrap();
    assert_eq!(listed["records"].as_array().unwrap().len(), 1);

    let response = authed(client.post(format!("{}/v1/downtime/{}/resolve", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let resolved: Value = response.json().await.unwrap();
    assert!(resolved["end_time"].is_string());
    assert!(resolved["backfill_job_id"].is_null());

    let response = authed(client.post(format!("{}/v1/downtime/{}/resolve", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = authed(client.get(format!("{}/v1/downtime/{}", url, id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = authed(client.post(format!("{}/v1/downtime/watch", url)))
        .json(&json!({
            "workflow_id": "wf-orders",
            "connector_id": "stripe",
            "health_url": "ftp://hooks.example.com/health"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = authed(client.post(format!("{}/v1/downtime/watch", url)))
        .json(&json!({
            "workflow_id": "wf-orders",
            "connector_id": "stripe",
            "health_url": "https://hooks.example.com/health"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(app.state.monitor.targets().len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn analytics_summarises_finished_jobs() {
    let (url, app, handle) = spawn_app(test_config(), 3, Duration::ZERO).await;
    let client = reqwest::Client::new();

    let response = authed(client.post(format!("{}/v1/backfill/jobs", url)))
        .json(&job_body("stripe", true))
        .send()
        .await
        .unwrap();
    let job: Value = response.json().await.unwrap();
    wait_until_settled(&app.state.manager, job["id"].as_str().unwrap().parse().unwrap()).await;

    let response = authed(client.get(format!("{}/v1/backfill/analytics", url)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report: Value = response.json().await.unwrap();
    assert_eq!(report["total_jobs"], 1);
    assert_eq!(report["jobs_by_status"]["completed"], 1);
    assert_eq!(report["events_recovered"], 3);
    assert_eq!(report["top_connectors"][0]["connector_id"], "stripe");

    let response = authed(client.get(format!(
        "{}/v1/backfill/analytics?start=2025-02-01T00:00:00Z&end=2025-01-01T00:00:00Z",
        url
    )))
    .send()
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    handle.shutdown().await.unwrap();
}
