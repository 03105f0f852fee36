//! # Server Configuration
//!
//! Router assembly, shared state and the process lifecycle of the backfill
//! service: store selection, background tasks and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::analytics::Analytics;
use crate::auth::auth_middleware;
use crate::backfill::{BackfillManager, BackfillStore, EngineSettings, JobProcessor, MemoryStore};
use crate::config::AppConfig;
use crate::connectors::ConnectorRegistry;
use crate::db;
use crate::downtime::{DowntimeDetector, DowntimeSettings, HealthMonitor, HealthProbe, HttpHealthProbe};
use crate::execution::{DryRunExecutor, HttpWorkflowExecutor, WorkflowExecutor};
use crate::handlers;
use crate::repositories::SeaOrmStore;
use crate::telemetry::trace_context_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub manager: BackfillManager,
    pub detector: DowntimeDetector,
    pub monitor: Arc<HealthMonitor>,
    pub analytics: Arc<Analytics>,
}

impl AppState {
    /// Wire the engine components around one store.
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn BackfillStore>,
        registry: ConnectorRegistry,
        executor: Arc<dyn WorkflowExecutor>,
        probe: Arc<dyn HealthProbe>,
        shutdown: CancellationToken,
    ) -> Self {
        let manager = BackfillManager::new(
            Arc::clone(&store),
            Arc::new(registry),
            executor,
            EngineSettings::from_config(&config),
        );
        let detector = DowntimeDetector::new(
            manager.clone(),
            DowntimeSettings::from_config(&config),
            shutdown,
        );
        let monitor = Arc::new(HealthMonitor::new(
            detector.clone(),
            probe,
            Duration::from_secs(config.downtime.health_check_seconds),
        ));

        Self {
            config,
            manager,
            detector,
            monitor,
            analytics: Arc::new(Analytics::new(store)),
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/backfill/jobs",
            post(handlers::jobs::create_job).get(handlers::jobs::list_jobs),
        )
        .route("/backfill/jobs/{id}", get(handlers::jobs::get_job))
        .route(
            "/backfill/jobs/{id}/events",
            get(handlers::jobs::list_job_events),
        )
        .route("/backfill/jobs/{id}/start", post(handlers::jobs::start_job))
        .route("/backfill/jobs/{id}/pause", post(handlers::jobs::pause_job))
        .route("/backfill/jobs/{id}/cancel", post(handlers::jobs::cancel_job))
        .route("/backfill/jobs/{id}/retry", post(handlers::jobs::retry_job))
        .route(
            "/backfill/connectors",
            get(handlers::connectors::list_connectors),
        )
        .route(
            "/backfill/connectors/{id}",
            get(handlers::connectors::get_connector),
        )
        .route(
            "/backfill/analytics",
            get(handlers::analytics::get_analytics),
        )
        .route(
            "/downtime",
            post(handlers::downtime::detect_downtime).get(handlers::downtime::list_downtime),
        )
        .route("/downtime/watch", post(handlers::downtime::watch_pair))
        .route("/downtime/{id}", get(handlers::downtime::get_downtime))
        .route(
            "/downtime/{id}/resolve",
            post(handlers::downtime::resolve_downtime),
        )
        .route_layer(from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .nest("/v1", api)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(trace_context_middleware))
        .layer(CorsLayer::permissive())
}

/// Pick the store: SeaORM when a database URL is configured, memory otherwise.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn BackfillStore>> {
    if config
        .database_url
        .as_deref()
        .is_none_or(|url| url.trim().is_empty())
    {
        tracing::warn!("No database configured, jobs are kept in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let db = db::init_pool(config).await?;
    Migrator::up(&db, None)
        .await
        .context("applying database migrations")?;
    Ok(Arc::new(SeaOrmStore::new(db)))
}

fn build_executor(config: &AppConfig) -> anyhow::Result<Arc<dyn WorkflowExecutor>> {
    match config.workflow_executor_url.as_deref() {
        Some(url) => {
            let timeout = Duration::from_millis(config.engine.default_timeout_ms);
            let executor =
                HttpWorkflowExecutor::new(url, config.workflow_executor_token.clone(), timeout)
                    .context("building workflow executor client")?;
            Ok(Arc::new(executor))
        }
        None => {
            tracing::warn!(
                profile = %config.profile,
                "No workflow executor configured, recovered events are only logged"
            );
            Ok(Arc::new(DryRunExecutor))
        }
    }
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr().context("Invalid server address")?;
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let store = open_store(&config).await?;
    let executor = build_executor(&config)?;
    let probe: Arc<dyn HealthProbe> = Arc::new(
        HttpHealthProbe::new(Duration::from_millis(config.engine.default_timeout_ms))
            .context("building health probe client")?,
    );
    let state = AppState::new(
        Arc::clone(&config),
        store,
        ConnectorRegistry::from_config(&config),
        executor,
        probe,
        shutdown.clone(),
    );

    let processor = JobProcessor::new(state.manager.clone());
    let processor_task = tokio::spawn(processor.run(shutdown.clone()));
    let monitor_task = tokio::spawn(Arc::clone(&state.monitor).run(shutdown.clone()));

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                }
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(processor_task, monitor_task);
    tracing::info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::jobs::create_job,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::list_job_events,
        crate::handlers::jobs::start_job,
        crate::handlers::jobs::pause_job,
        crate::handlers::jobs::cancel_job,
        crate::handlers::jobs::retry_job,
        crate::handlers::connectors::list_connectors,
        crate::handlers::connectors::get_connector,
        crate::handlers::analytics::get_analytics,
        crate::handlers::downtime::detect_downtime,
        crate::handlers::downtime::resolve_downtime,
        crate::handlers::downtime::list_downtime,
        crate::handlers::downtime::get_downtime,
        crate::handlers::downtime::watch_pair,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthStatus,
            crate::error::ApiError,
            crate::handlers::jobs::CreateJobRequest,
            crate::handlers::jobs::JobsResponse,
            crate::handlers::jobs::EventsResponse,
            crate::handlers::connectors::ConnectorInfo,
            crate::handlers::connectors::ConnectorsResponse,
            crate::handlers::downtime::DetectDowntimeRequest,
            crate::handlers::downtime::WatchRequest,
            crate::handlers::downtime::DowntimeResponse,
            crate::backfill::BackfillJob,
            crate::backfill::RecoveredEvent,
            crate::analytics::AnalyticsReport,
            crate::downtime::DowntimeRecord,
            crate::downtime::WatchTarget,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "jobs", description = "Backfill job lifecycle"),
        (name = "connectors", description = "Connector capabilities"),
        (name = "analytics", description = "Recovery statistics"),
        (name = "downtime", description = "Webhook downtime tracking"),
    ),
    info(
        title = "Webhook Backfill API",
        description = "Recovers webhook events missed during downtime",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
