pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use config::Config;
use db::leaderboard::LeaderboardStore;
use gateway::fanout::LeaderboardBroadcaster;
use gateway::origin::OriginPolicy;
use gateway::polling::PollingSessions;
use gateway::registry::ConnectionRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn LeaderboardStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<LeaderboardBroadcaster>,
    pub polling: Arc<PollingSessions>,
    pub origins: Arc<OriginPolicy>,
}

impl AppState {
    /// Wire the registry, fan-out and transports around `store`.
    pub fn new(config: Config, store: Arc<dyn LeaderboardStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(LeaderboardBroadcaster::new(
            registry.clone(),
            store.clone(),
            config.leaderboard_size,
        ));
        let origins = Arc::new(OriginPolicy::new(&config.allowed_origins));

        Self {
            config: Arc::new(config),
            store,
            registry,
            broadcaster,
            polling: Arc::new(PollingSessions::new()),
            origins,
        }
    }
}

/// Build the full HTTP application for `state`.
pub fn app(state: AppState) -> Router {
    routes::router(&state.origins)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let config = Config::from_lookup(|name| {
        (name == "DATABASE_URL").then(|| "postgres://localhost/relay_test".to_string())
    })
    .unwrap();
    AppState::new(config, Arc::new(db::leaderboard::MemoryLeaderboardStore::new()))
}
