//! HTTP request handlers
//!
//! Object endpoints are generic over the resource kind. A PUT writes the
//! object's metadata and spec; whatever status the orchestrator recorded is
//! kept.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_api::Resource;
use serde::Serialize;
use tracing::{debug, info};

use crate::server::state::ServerState;
use crate::store::{from_raw, to_raw, Api, StoreError};
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "fleetplane".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
    pub target: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
        target: version.target,
    })
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A failed request
#[derive(Debug)]
pub struct ApiFailure {
    pub status: StatusCode,
    pub message: String,
}

impl ApiFailure {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiFailure {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// List every object of one kind
pub async fn list_handler<K: Resource>(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<K>>, ApiFailure> {
    let api: Api<K> = Api::new(state.store.clone());
    Ok(Json(api.list().await?))
}

/// Get one object
pub async fn get_handler<K: Resource>(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<K>, ApiFailure> {
    let api: Api<K> = Api::new(state.store.clone());
    match api.get(&name).await? {
        Some(object) => Ok(Json(object)),
        None => Err(ApiFailure::new(
            StatusCode::NOT_FOUND,
            format!("{} {} not found", K::KIND, name),
        )),
    }
}

/// Create or replace one object, keeping its recorded status
pub async fn put_handler<K: Resource>(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(mut object): Json<K>,
) -> Result<(StatusCode, Json<K>), ApiFailure> {
    let body_name = &object.meta().name;
    if !body_name.is_empty() && body_name != &name {
        return Err(ApiFailure::new(
            StatusCode::BAD_REQUEST,
            format!("metadata.name {} does not match {}", body_name, name),
        ));
    }
    object.meta_mut().name = name.clone();

    let mut raw = to_raw(&object)?;
    let Some(body) = raw.body.as_object_mut() else {
        return Err(ApiFailure::new(StatusCode::BAD_REQUEST, "object body is not a map"));
    };
    body.remove("status");

    match state.store.get(K::KIND, &name).await? {
        None => {
            let created = state.store.create(raw).await?;
            info!("created {} {}", K::KIND, name);
            Ok((StatusCode::CREATED, Json(from_raw(created)?)))
        }
        Some(existing) => {
            if let Some(status) = existing.body.get("status") {
                body.insert("status".to_string(), status.clone());
            }
            raw.metadata.resource_version = existing.metadata.resource_version;
            raw.metadata.finalizers = existing.metadata.finalizers;
            let replaced = state.store.replace(raw).await?;
            debug!("replaced {} {}", K::KIND, name);
            Ok((StatusCode::OK, Json(from_raw(replaced)?)))
        }
    }
}

/// Delete one object; objects with finalizers linger until cleaned up
pub async fn delete_handler<K: Resource>(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    if state.store.delete(K::KIND, &name).await? {
        info!("deleting {} {}", K::KIND, name);
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiFailure::new(
            StatusCode::NOT_FOUND,
            format!("{} {} not found", K::KIND, name),
        ))
    }
}
