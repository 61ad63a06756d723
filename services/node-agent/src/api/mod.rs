//! Management HTTP API.

pub mod error;

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use pv6_models::{NodeReport, ProxyInstance, ProxyMetrics};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::manager::ProxyManager;
use crate::reporter::{build_report, NodeIdentity};
use error::ApiError;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AgentState {
    pub manager: Arc<ProxyManager>,
    pub identity: Arc<NodeIdentity>,
}

/// Create the management router.
pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/proxies", get(list_proxies))
        .route("/proxy/{id}/stop", post(stop_proxy))
        .route("/proxy/{id}/metrics", post(update_metrics))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

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
        status: "ok".to_string(),
        service: "agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn list_proxies(State(state): State<AgentState>) -> Json<Vec<ProxyInstance>> {
    Json(state.manager.get_instances().await)
}

async fn stop_proxy(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<Json<ProxyInstance>, ApiError> {
    let instance = state.manager.stop_proxy(&id).await?;
    Ok(Json(instance))
}

async fn update_metrics(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    payload: Result<Json<ProxyMetrics>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(metrics) =
        payload.map_err(|e| ApiError::bad_request("invalid_payload", e.body_text()))?;
    state.manager.update_metrics(&id, metrics).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(state): State<AgentState>) -> Json<NodeReport> {
    Json(build_report(&state.identity, &state.manager).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use pv6_models::{Ipv6Address, ProxyStatus};
    use tower::ServiceExt;

    use crate::daemon::{MockBehavior, MockLauncher};
    use crate::manager::{ManagerSettings, PortRange};
    use error::ErrorBody;

    fn agent_state(dir: &std::path::Path) -> AgentState {
        let settings = ManagerSettings {
            // Nothing listens on loopback port 1, so unreachable daemons stay unreachable.
            port_range: PortRange::new(1, 1).unwrap(),
            runtime_dir: dir.to_path_buf(),
            startup_attempts: 1,
            startup_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(200),
        };
        let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior::Unreachable));
        AgentState {
            manager: Arc::new(ProxyManager::new(settings, launcher)),
            identity: Arc::new(NodeIdentity {
                node_id: "node-a".to_string(),
                hostname: "host-a".to_string(),
                region: Some("eu-west".to_string()),
            }),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(router: Router, method: &str, uri: &str, body: Body) -> axum::response::Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        router.oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(agent_state(dir.path()));
        let response = send(router, "GET", "/health", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(agent_state(dir.path()));

        let response = send(router.clone(), "POST", "/proxy/nope/stop", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.code, "unknown_instance");
        assert_eq!(body.status, 404);

        let response = send(
            router,
            "POST",
            "/proxy/nope/metrics",
            Body::from(r#"{"requests_total": 1}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_metrics_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(agent_state(dir.path()));
        let response = send(router, "POST", "/proxy/x/metrics", Body::from("{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.code, "invalid_payload");
    }

    #[tokio::test]
    async fn test_proxy_lifecycle_through_api() {
        let dir = tempfile::tempdir().unwrap();
        let state = agent_state(dir.path());
        let router = create_router(state.clone());

        let address = Ipv6Address::new("::ffff:127.0.0.1".parse().unwrap(), "lo", false);
        let err = state.manager.start_proxy(address).await.unwrap_err();
        let id = err.instance().unwrap().id.clone();

        let response = send(router.clone(), "GET", "/proxies", Body::empty()).await;
        let proxies: Vec<ProxyInstance> = body_json(response).await;
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].status, ProxyStatus::Error);

        let response = send(
            router.clone(),
            "POST",
            &format!("/proxy/{id}/metrics"),
            Body::from(r#"{"requests_total": 12, "bytes_transmitted": 4096}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(router.clone(), "GET", "/status", Body::empty()).await;
        let report: NodeReport = body_json(response).await;
        assert_eq!(report.node_id, "node-a");
        assert_eq!(report.region.as_deref(), Some("eu-west"));
        assert_eq!(report.proxies[0].metrics.requests_total, 12);

        let response = send(router, "POST", &format!("/proxy/{id}/stop"), Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let stopped: ProxyInstance = body_json(response).await;
        assert_eq!(stopped.status, ProxyStatus::Stopped);
    }
}
