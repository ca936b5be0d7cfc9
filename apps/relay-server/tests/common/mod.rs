use std::net::SocketAddr;
use std::sync::Arc;

use axum_test::TestServer;

use relay_server::config::Config;
use relay_server::db::leaderboard::MemoryLeaderboardStore;
use relay_server::AppState;

/// Development config; the database URL is never dialled in tests.
pub fn test_config() -> Config {
    config_with(&[])
}

/// Development config plus extra variables.
pub fn config_with(extra: &[(&str, &str)]) -> Config {
    let extra: Vec<(String, String)> = extra
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|name| {
        if name == "DATABASE_URL" {
            return Some("postgres://localhost/relay_test".to_string());
        }
        extra
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    })
    .expect("test config")
}

/// Build a test AppState backed by an in-memory leaderboard.
pub fn test_state() -> (AppState, Arc<MemoryLeaderboardStore>) {
    state_with_config(test_config())
}

pub fn state_with_config(config: Config) -> (AppState, Arc<MemoryLeaderboardStore>) {
    let store = Arc::new(MemoryLeaderboardStore::new());
    let state = AppState::new(config, store.clone());
    (state, store)
}

/// In-process server for control-plane requests.
pub fn test_server(state: AppState) -> TestServer {
    TestServer::new(relay_server::app(state)).expect("test server")
}

/// Start an actual TCP server for transport tests. The server runs in the background.
pub async fn start_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let app = relay_server::app(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}
