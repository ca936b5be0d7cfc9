use std::fmt;

use thiserror::Error;

/// Origins accepted by the realtime handshake outside production.
pub const DEV_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:3000"];

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_LEADERBOARD_SIZE: usize = 20;

/// Deployment mode. Controls the origin allow-list and default log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    /// Read `APP_ENV` (falling back to `NODE_ENV`) from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let raw = lookup("APP_ENV").or_else(|| lookup("NODE_ENV"));
        match raw.as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("production") => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }

    /// Filter directive used when `RUST_LOG` is not set.
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Production => "info",
            Self::Development => "debug",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} env var is required")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Relay server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string for the aggregate store.
    pub database_url: String,
    pub environment: Environment,
    /// Origins allowed to open a realtime connection.
    pub allowed_origins: Vec<String>,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Number of ranked rows pushed to clients.
    pub leaderboard_size: usize,
    /// Shared secret for `POST /broadcast`. `None` leaves the trigger open.
    pub broadcast_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let environment = Environment::from_lookup(&var);

        let allowed_origins = match environment {
            Environment::Production => {
                let origin = var("FRONTEND_URL").ok_or(ConfigError::Missing("FRONTEND_URL"))?;
                vec![origin.trim_end_matches('/').to_string()]
            }
            Environment::Development => DEV_ORIGINS.iter().map(|o| o.to_string()).collect(),
        };

        let port = match var("WEBSOCKET_PORT").or_else(|| var("PORT")) {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "WEBSOCKET_PORT",
                value: raw,
            })?,
            None => DEFAULT_PORT,
        };

        let leaderboard_size = match var("LEADERBOARD_SIZE") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "LEADERBOARD_SIZE",
                        value: raw,
                    })
                }
            },
            None => DEFAULT_LEADERBOARD_SIZE,
        };

        Ok(Self {
            database_url,
            environment,
            allowed_origins,
            port,
            leaderboard_size,
            broadcast_token: var("BROADCAST_TOKEN"),
        })
    }
}
