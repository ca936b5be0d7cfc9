use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health).fallback(super::not_found))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"healthy"` while the process serves requests.
    pub status: &'static str,
    /// `"production"` or `"development"`.
    pub environment: &'static str,
    pub timestamp: String,
    pub connected_clients: usize,
    /// Aggregate store reachability, `"connected"` or `"disconnected"`. The key
    /// name is kept for existing monitors.
    #[serde(rename = "mongodb")]
    pub store: &'static str,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = if state.store.is_connected() {
        "connected"
    } else {
        "disconnected"
    };

    Json(HealthResponse {
        status: "healthy",
        environment: state.config.environment.as_str(),
        timestamp: relay_common::iso_timestamp(Utc::now()),
        connected_clients: state.registry.size(),
        store,
    })
}
