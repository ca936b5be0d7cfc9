//! Control-plane trigger: the write path asks for a leaderboard re-broadcast.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::Config;
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/broadcast", post(trigger_broadcast).fallback(super::not_found))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BroadcastRequest {
    /// Only `"updateLeaderboard"` is recognised.
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BroadcastResponse {
    pub success: bool,
    pub message: String,
    /// Connections the update was queued to.
    pub recipients: usize,
}

/// Actions the trigger understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    UpdateLeaderboard,
}

impl TriggerAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "updateLeaderboard" => Some(Self::UpdateLeaderboard),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// POST /broadcast
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/broadcast",
    tag = "Broadcast",
    request_body = BroadcastRequest,
    responses(
        (status = 200, description = "Update pushed to all clients", body = BroadcastResponse),
        (status = 400, description = "Malformed body or unknown action", body = ApiErrorBody),
        (status = 401, description = "Missing or wrong broadcast token", body = ApiErrorBody),
        (status = 500, description = "Aggregate store unavailable", body = ApiErrorBody),
    ),
)]
pub async fn trigger_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BroadcastResponse>, ApiError> {
    authorize(&state.config, &headers)?;

    let request: BroadcastRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Invalid request body"))?;
    let action = request
        .action
        .as_deref()
        .and_then(TriggerAction::parse)
        .ok_or_else(|| {
            tracing::debug!(action = ?request.action, "rejected broadcast trigger");
            ApiError::bad_request("Invalid action")
        })?;

    match action {
        TriggerAction::UpdateLeaderboard => {
            let report = state.broadcaster.broadcast_update().await?;
            Ok(Json(BroadcastResponse {
                success: true,
                message: "Broadcast triggered".to_string(),
                recipients: report.delivered,
            }))
        }
    }
}

/// Enforce `BROADCAST_TOKEN` when one is configured.
fn authorize(config: &Config, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = config.broadcast_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::unauthorized("Unauthorized")),
    }
}
