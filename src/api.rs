//! HTTP observability endpoints
//!
//! A small axum router over the statistics manager: liveness, the full
//! counters snapshot, and the per-connection listing.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use crate::stats::StatsManager;

#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<StatsManager>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/stats", get(stats_snapshot))
        .route("/api/v1/connections", get(connections))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stats_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats.to_json())
}

async fn connections(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.stats.to_json();
    Json(serde_json::json!({
        "count": snapshot["connections"].as_array().map(|a| a.len()).unwrap_or(0),
        "connections": snapshot["connections"],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stats_snapshot_serves_json() {
        let stats = Arc::new(StatsManager::new());
        stats.add_connection("peer:1", "framed", "v/a/s", "peer:1");
        let state = AppState { stats };

        let json = state.stats.to_json();
        assert!(json["global_stats"].is_object());
        assert_eq!(json["connections"].as_array().unwrap().len(), 1);
    }
}
