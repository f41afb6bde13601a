//! Audit, topology, and health route handlers

use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use trustplane_core::types::{AuditRecord, Decision, DeviceStatus};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    /// RFC 3339 timestamp; defaults to the last 24 hours
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TopologyEntry {
    pub device_id: String,
    pub mac: String,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub current_decision: Option<Decision>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/decisions", get(decisions))
}

/// GET /audit/decisions?since={rfc3339}
async fn decisions(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let since = match query.since {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ApiError::validation(format!("invalid since timestamp: {}", raw)))?,
        None => Utc::now() - Duration::hours(24),
    };
    Ok(Json(state.store.audit_since(since).await?))
}

/// GET /topology
///
/// Revoked devices remain visible, but carry their quarantine decision
/// and are never reported as connected.
pub async fn topology(
    State(state): State<AppState>,
) -> Result<Json<Vec<TopologyEntry>>, ApiError> {
    let devices = state.store.list_devices().await?;
    Ok(Json(
        devices
            .into_iter()
            .map(|device| TopologyEntry {
                current_decision: state.orchestrator.current_decision(&device.id),
                device_id: device.id.to_string(),
                mac: device.mac.to_string(),
                status: device.status,
                last_seen: device.last_seen,
            })
            .collect(),
    ))
}

/// GET /health - liveness probe
pub async fn health(State(_state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
