//! Registry HTTP API.

pub mod error;
pub mod nodes;

use axum::{response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the registry router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/nodes", get(nodes::list_nodes))
        .route(
            "/api/nodes/{node_id}",
            get(nodes::get_node).post(nodes::submit_report),
        )
        .route("/api/stats", get(nodes::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "coordinator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
