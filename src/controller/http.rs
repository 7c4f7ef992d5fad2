//! HTTP API for the deployment controller
//!
//! All JSON responses share one envelope:
//! `{"success": bool, "message"?: str, "data"?: any, "error"?: str}`.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::common::{request_tracing_middleware, Error, StoreConfig, METRICS};
use crate::ingest::{BatchIngestor, BatchOutcome};
use crate::store::{DeploymentKey, DeploymentStatus, Store};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub ingestor: BatchIngestor,
    pub health_timeout: Duration,
}

impl AppState {
    pub fn new(store: Store, config: &StoreConfig) -> Self {
        Self {
            ingestor: BatchIngestor::new(store.records.clone(), config.batch_timeout()),
            health_timeout: config.health_timeout(),
            store,
        }
    }
}

/// Standard response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ok(status: StatusCode, message: Option<&str>, data: Option<serde_json::Value>) -> Response {
    let body = ApiResponse {
        success: true,
        message: message.map(str::to_string),
        data,
        error: None,
    };
    (status, Json(body)).into_response()
}

/// A failed request, rendered with the envelope
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// An unreadable body is a 400, except an oversize one which stays 413.
    fn from_rejection(e: JsonRejection) -> Self {
        warn!(error = %e, "Invalid request body");
        let status = match e.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: format!("Invalid request body: {}", e.body_text()),
        }
    }

    /// Client-facing errors keep their message; internal ones are logged and
    /// replaced with `fallback`.
    fn from_store(e: Error, fallback: &str) -> Self {
        let status = e.to_http_status();
        let message = match &e {
            Error::Validation(_) | Error::EmptyBatch | Error::NotFound(_) => e.to_string(),
            Error::Timeout(_) | Error::StoreUnavailable(_) => {
                warn!(error = %e, "{}", fallback);
                format!("{}: {}", fallback, e)
            }
            _ => {
                error!(error = %e, "{}", fallback);
                fallback.to_string()
            }
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            success: false,
            message: None,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

fn to_value<T: Serialize>(value: &T) -> std::result::Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("Failed to encode response: {}", e),
    })
}

fn parse_id(raw: &str) -> std::result::Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        warn!(id = raw, "Invalid deployment ID");
        ApiError::bad_request("Invalid deployment ID")
    })
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/push", post(push))
        .route("/api/v1/deployments", get(list_deployments))
        .route("/api/v1/deployments/:id", get(get_deployment))
        .route("/api/v1/deployments/:id/status", patch(update_status))
        .route("/api/v1/apps/:domain/:app_name/versions", get(app_versions))
        .route("/api/v1/registry", post(store_registry).get(get_registry))
        .route("/api/v1/stats", get(stats))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

/// Liveness probe: the record store answers within the health timeout.
async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping(state.health_timeout).await {
        Ok(()) => ok(
            StatusCode::OK,
            Some("Service is healthy"),
            Some(json!({
                "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                "version": crate::VERSION,
            })),
        ),
        Err(e) => {
            error!(error = %e, "Database health check failed");
            ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "Database connection failed".to_string(),
            }
            .into_response()
        }
    }
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}

/// Accept a batch of deployment changes.
///
/// 201 when every item was written, 206 when some were, 400 when none were.
/// Items are decoded one by one so a mistyped field only fails its own item.
async fn push(
    State(state): State<AppState>,
    body: std::result::Result<Json<Vec<serde_json::Value>>, JsonRejection>,
) -> ApiResult {
    let Json(items) = body.map_err(ApiError::from_rejection)?;
    if let Some(index) = items.iter().position(|item| !item.is_object()) {
        return Err(ApiError::bad_request(format!(
            "Invalid request body: item {} is not an object",
            index
        )));
    }

    let result = state
        .ingestor
        .ingest_json(items)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to process push"))?;

    let status = match result.outcome() {
        BatchOutcome::AllSucceeded => StatusCode::CREATED,
        BatchOutcome::Partial => StatusCode::PARTIAL_CONTENT,
        BatchOutcome::AllFailed => StatusCode::BAD_REQUEST,
    };

    let mut data = json!({
        "request_id": result.request_id,
        "processed_count": result.processed_count(),
        "failed_count": result.failed_count(),
        "created_deployments": to_value(&result.created)?,
    });
    if !result.failed.is_empty() {
        data["failed_deployments"] = to_value(&result.failed)?;
    }

    let body = ApiResponse {
        success: !result.created.is_empty(),
        message: Some("Deployment push processed".to_string()),
        data: Some(data),
        error: None,
    };
    Ok((status, Json(body)).into_response())
}

async fn list_deployments(State(state): State<AppState>) -> ApiResult {
    let deployments = state
        .store
        .records
        .list_latest()
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to get deployments"))?;
    Ok(ok(StatusCode::OK, None, Some(to_value(&deployments)?)))
}

async fn get_deployment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id)?;
    let deployment = state
        .store
        .records
        .get_by_id(id)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to get deployment"))?;
    Ok(ok(StatusCode::OK, None, Some(to_value(&deployment)?)))
}

async fn app_versions(
    State(state): State<AppState>,
    Path((domain, app_name)): Path<(String, String)>,
) -> ApiResult {
    let history = state
        .store
        .records
        .history(DeploymentKey::new(domain, app_name))
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to get deployment history"))?;
    Ok(ok(StatusCode::OK, None, Some(to_value(&history)?)))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<StatusUpdate>, JsonRejection>,
) -> ApiResult {
    let id = parse_id(&id)?;
    let Json(req) = body.map_err(ApiError::from_rejection)?;
    let status: DeploymentStatus = req
        .status
        .parse()
        .map_err(|e| ApiError::from_store(e, "Invalid status"))?;

    let record = state
        .store
        .records
        .update_status(id, status)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to update deployment status"))?;

    info!(%id, %status, "Updated deployment status");
    Ok(ok(
        StatusCode::OK,
        Some("Deployment status updated successfully"),
        Some(to_value(&record)?),
    ))
}

#[derive(Debug, Deserialize)]
struct RegistryCredentialRequest {
    registry: String,
    username: String,
    password: String,
}

async fn store_registry(
    State(state): State<AppState>,
    body: std::result::Result<Json<RegistryCredentialRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(ApiError::from_rejection)?;

    state
        .store
        .credentials
        .store(&req.registry, &req.username, &req.password)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to store registry credential"))?;

    info!(registry = %req.registry, "Stored registry credential");
    Ok(ok(
        StatusCode::CREATED,
        Some("Registry credential stored successfully"),
        None,
    ))
}

#[derive(Debug, Deserialize)]
struct RegistryQuery {
    registry: Option<String>,
}

async fn get_registry(State(state): State<AppState>, Query(q): Query<RegistryQuery>) -> ApiResult {
    let registry = q
        .registry
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::bad_request("registry parameter is required"))?;

    let cred = state
        .store
        .credentials
        .get(&registry)
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to get registry credential"))?;

    Ok(ok(
        StatusCode::OK,
        None,
        Some(json!({
            "registry": cred.registry,
            "username": cred.username,
            "password": cred.password,
        })),
    ))
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    let stats = state
        .store
        .records
        .stats()
        .await
        .map_err(|e| ApiError::from_store(e, "Failed to get deployment stats"))?;
    Ok(ok(StatusCode::OK, None, Some(to_value(&stats)?)))
}
