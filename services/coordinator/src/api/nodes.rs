//! Node report endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use pv6_ingress::IngressStatsSnapshot;
use pv6_models::NodeReport;
use serde::Serialize;
use tracing::info;

use super::error::ApiError;
use crate::registry::RegistryStats;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct UpdateResponse {
    pub status: String,
}

/// Registry totals plus the ingress view.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub timestamp: DateTime<Utc>,
    pub endpoints: usize,
    pub healthy_endpoints: usize,
    pub ingress: IngressStatsSnapshot,
}

/// Store a node's report under the id in the path, then rebuild the
/// balancer from the whole registry.
pub async fn submit_report(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    payload: Result<Json<NodeReport>, JsonRejection>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let Json(report) =
        payload.map_err(|e| ApiError::bad_request("invalid_report", e.body_text()))?;

    let running = report.running().count();
    if state.registry().upsert(&node_id, report).await {
        info!(node_id = %node_id, running, "Registered new node");
    }
    state.refresh_balancer().await;

    Ok(Json(UpdateResponse {
        status: "updated".to_string(),
    }))
}

pub async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeReport>> {
    Json(state.registry().list().await)
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeReport>, ApiError> {
    state
        .registry()
        .get(&node_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("unknown_node", format!("unknown node: {node_id}")))
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = state.registry().stats().await;
    let (endpoints, healthy_endpoints) = state.balancer().counts().await;
    Json(StatsResponse {
        registry,
        timestamp: Utc::now(),
        endpoints,
        healthy_endpoints,
        ingress: state.ingress_stats().snapshot(),
    })
}
