//! Device management route handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trustplane_core::types::{Baseline, Device, DeviceId, Policy, TrustEvent};

use crate::error::ApiError;
use crate::state::AppState;

/// Optional administrator note on state-changing operations
#[derive(Debug, Default, Deserialize)]
pub struct NoteRequest {
    #[serde(default)]
    pub note: Option<String>,
}

impl NoteRequest {
    fn note(&self) -> &str {
        self.note.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Serialize)]
pub struct PendingDeviceResponse {
    pub device_id: String,
    pub mac: String,
    pub device_type: String,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TrustResponse {
    pub device_id: String,
    pub score: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

fn parse_device_id(raw: &str) -> Result<DeviceId, ApiError> {
    DeviceId::new(raw).map_err(ApiError::validation)
}

/// Device management routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_devices))
        .route("/pending", get(list_pending))
        .route("/{device_id}", get(get_device))
        .route("/{device_id}/approve", post(approve_device))
        .route("/{device_id}/reject", post(reject_device))
        .route("/{device_id}/revoke", post(revoke_device))
        .route("/{device_id}/release", post(release_device))
        .route("/{device_id}/finalize", post(finalize_device))
        .route("/{device_id}/trust", get(get_trust))
        .route("/{device_id}/trust/history", get(get_trust_history))
        .route("/{device_id}/policy", get(get_policy))
        .route("/{device_id}/baseline", get(get_baseline))
}

/// GET /devices - every known device, revoked included
async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, ApiError> {
    Ok(Json(state.store.list_devices().await?))
}

/// GET /devices/pending
async fn list_pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingDeviceResponse>>, ApiError> {
    let pending = state.coordinator.list_pending().await?;
    Ok(Json(
        pending
            .into_iter()
            .map(|p| PendingDeviceResponse {
                device_id: p.id.to_string(),
                mac: p.mac.to_string(),
                device_type: p.device_type,
                first_seen: p.first_seen,
            })
            .collect(),
    ))
}

/// GET /devices/{device_id}
async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let id = parse_device_id(&device_id)?;
    Ok(Json(state.store.get_device(&id).await?))
}

/// POST /devices/{device_id}/approve
#[tracing::instrument(skip(state, req))]
async fn approve_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<NoteRequest>,
) -> Result<Json<Device>, ApiError> {
    let id = parse_device_id(&device_id)?;
    let device = state.coordinator.approve_device(&id, req.note()).await?;
    Ok(Json(device))
}

/// POST /devices/{device_id}/reject
#[tracing::instrument(skip(state, req))]
async fn reject_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<NoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_device_id(&device_id)?;
    state.coordinator.reject_device(&id, req.note()).await?;
    Ok(StatusCode::OK)
}

/// POST /devices/{device_id}/revoke
#[tracing::instrument(skip(state, req))]
async fn revoke_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<NoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_device_id(&device_id)?;
    state.coordinator.revoke_device(&id, req.note()).await?;
    Ok(StatusCode::OK)
}

/// POST /devices/{device_id}/release - quarantine release, admin only
#[tracing::instrument(skip(state, req))]
async fn release_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<NoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_device_id(&device_id)?;
    state.coordinator.release_quarantine(&id, req.note()).await?;
    Ok(StatusCode::OK)
}

/// POST /devices/{device_id}/finalize - close the profiling window now
#[tracing::instrument(skip(state))]
async fn finalize_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_device_id(&device_id)?;
    state.coordinator.finalize_device(&id).await?;
    Ok(StatusCode::OK)
}

/// GET /devices/{device_id}/trust
async fn get_trust(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<TrustResponse>, ApiError> {
    let id = parse_device_id(&device_id)?;
    let score = state.store.current_trust(&id).await?;
    Ok(Json(TrustResponse {
        device_id: id.to_string(),
        score,
    }))
}

/// GET /devices/{device_id}/trust/history?limit=N
async fn get_trust_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<TrustEvent>>, ApiError> {
    let id = parse_device_id(&device_id)?;
    // Ensure the device exists so a miss is a 404, not an empty list
    state.store.get_device(&id).await?;
    Ok(Json(state.store.trust_history(&id, query.limit).await?))
}

/// GET /devices/{device_id}/policy
async fn get_policy(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Policy>, ApiError> {
    let id = parse_device_id(&device_id)?;
    state
        .store
        .get_policy(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(trustplane_core::Error::not_found("policy", id.as_str())))
}

/// GET /devices/{device_id}/baseline
async fn get_baseline(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Baseline>, ApiError> {
    let id = parse_device_id(&device_id)?;
    state
        .store
        .get_baseline(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(trustplane_core::Error::not_found("baseline", id.as_str())))
}
