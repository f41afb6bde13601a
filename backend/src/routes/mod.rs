//! Management API routes

pub mod audit;
pub mod devices;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Assemble the full API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/devices", devices::routes())
        .nest("/api/v1/audit", audit::routes())
        .route("/api/v1/topology", get(audit::topology))
        .route("/api/v1/health", get(audit::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
