use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_server::config::{Config, Environment};
use relay_server::db::leaderboard::{self, PgLeaderboardStore};
use relay_server::gateway::polling;
use relay_server::AppState;

/// How long in-flight requests (long-polls) may run after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let environment = Environment::from_env();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(environment.default_log_filter())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    install_panic_hook();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };
    let port = config.port;

    tracing::info!(
        environment = %config.environment,
        allowed_origins = ?config.allowed_origins,
        leaderboard_size = config.leaderboard_size,
        trigger_auth = config.broadcast_token.is_some(),
        "relay-server configured"
    );

    let store = match PgLeaderboardStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(%err, "aggregate store connection failed");
            std::process::exit(1);
        }
    };

    let state = AppState::new(config, Arc::new(store));
    leaderboard::spawn_connection_monitor(state.store.clone());
    polling::spawn_reaper(state.clone());
    let app = relay_server::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "relay-server listening");

    let stop = Arc::new(Notify::new());
    let server = axum::serve(listener, app)
        .with_graceful_shutdown({
            let stop = stop.clone();
            async move { stop.notified().await }
        })
        .into_future();

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                tracing::error!(%err, "server error");
                std::process::exit(1);
            }
        }
        _ = async {
            shutdown_signal().await;
            tracing::info!("shutting down, listener closed");
            stop.notify_one();
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!("grace period elapsed with requests still open");
        }
    }

    tracing::info!("relay-server stopped");
}

/// Resolve on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Any panic, on any task, takes the whole process down.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(%info, "unrecoverable panic");
        std::process::exit(1);
    }));
}
