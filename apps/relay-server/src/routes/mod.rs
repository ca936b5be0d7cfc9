pub mod broadcast;
pub mod health;

use axum::extract::Request;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use utoipa::OpenApi;

use crate::error::ApiError;
use crate::gateway::origin::OriginPolicy;
use crate::AppState;

/// Control-plane endpoints plus both realtime transports.
pub fn router(origins: &OriginPolicy) -> Router<AppState> {
    let control_plane = Router::new()
        .merge(health::router())
        .merge(broadcast::router())
        .merge(crate::gateway::server::router())
        .fallback(not_found)
        .layer(middleware::from_fn(control_plane_cors));

    control_plane.merge(crate::gateway::polling::router(origins))
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

/// Open CORS for the control plane: every response carries the headers and any
/// `OPTIONS` request is answered with an empty 200.
async fn control_plane_cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        broadcast::trigger_broadcast,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::models::leaderboard::LeaderboardEntry,
            health::HealthResponse,
            broadcast::BroadcastRequest,
            broadcast::BroadcastResponse,
        )
    ),
    tags(
        (name = "Health", description = "Liveness and connection gauge"),
        (name = "Broadcast", description = "Leaderboard re-broadcast trigger"),
    )
)]
pub struct ApiDoc;
