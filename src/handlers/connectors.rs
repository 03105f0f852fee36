//! # Connector Capability Handlers
//!
//! Read-only view of the connector catalogue.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::OperatorAuth;
use crate::connectors::{ConnectorCapability, RegistryError};
use crate::error::ApiError;
use crate::server::AppState;

/// A capability together with whether jobs can currently be started for it
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectorInfo {
    #[serde(flatten)]
    pub capability: ConnectorCapability,
    /// Supported and backed by a configured event source
    pub startable: bool,
}

/// Response payload for connector listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectorsResponse {
    pub connectors: Vec<ConnectorInfo>,
}

/// List known connectors sorted by id
#[utoipa::path(
    get,
    path = "/v1/backfill/connectors",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader),
    responses(
        (status = 200, description = "Connector catalogue", body = ConnectorsResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "connectors"
)]
pub async fn list_connectors(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Json<ConnectorsResponse> {
    let registry = state.manager.registry();
    let connectors = registry
        .list()
        .into_iter()
        .map(|capability| ConnectorInfo {
            startable: registry.is_supported(&capability.id),
            capability,
        })
        .collect();
    Json(ConnectorsResponse { connectors })
}

/// Fetch the capability of one connector
#[utoipa::path(
    get,
    path = "/v1/backfill/connectors/{id}",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = String, Path, description = "Connector ID")),
    responses(
        (status = 200, description = "Connector capability", body = ConnectorInfo),
        (status = 404, description = "Unknown connector", body = ApiError)
    ),
    tag = "connectors"
)]
pub async fn get_connector(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<String>,
) -> Result<Json<ConnectorInfo>, ApiError> {
    let registry = state.manager.registry();
    let capability = registry.capability(&id).map_err(|err| match err {
        RegistryError::ConnectorNotFound { .. } => {
            ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", &err.to_string())
        }
        other => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            &other.to_string(),
        ),
    })?;

    Ok(Json(ConnectorInfo {
        startable: registry.is_supported(&id),
        capability: capability.clone(),
    }))
}
