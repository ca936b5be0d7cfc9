//! Read access to the ranked aggregate table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::Object;
use diesel_async::AsyncPgConnection;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;

use crate::db::pool::{self, DbPool};
use crate::db::schema::country_clicks;
use crate::models::leaderboard::{CountryClicks, LeaderboardEntry, LeaderboardSnapshot};

/// How long to wait for a pooled connection before giving up.
pub const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single ranking query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(45);

/// How often the connection state is refreshed while no reads happen.
pub const CONNECTION_PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("aggregate store unavailable: {0}")]
    Unavailable(String),
    #[error("aggregate store timed out after {0:?}")]
    Timeout(Duration),
}

/// Source of ranked leaderboard rows.
///
/// Backed by PostgreSQL in production and an in-memory map in tests.
#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    /// Fetch the `n` highest-scoring entries, best first.
    async fn read_top_n(&self, n: usize) -> Result<LeaderboardSnapshot, StoreError>;

    /// Driver-level connection state. Must not issue a query.
    fn is_connected(&self) -> bool;

    /// Refresh the state behind `is_connected` without reading any rows.
    async fn probe(&self);
}

/// Keep `is_connected` current during idle periods.
pub fn spawn_connection_monitor(store: Arc<dyn LeaderboardStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = time::interval(CONNECTION_PROBE_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            store.probe().await;
        }
    })
}

// ---------------------------------------------------------------------------
// PostgreSQL implementation
// ---------------------------------------------------------------------------

pub struct PgLeaderboardStore {
    pool: DbPool,
    connected: AtomicBool,
}

impl PgLeaderboardStore {
    /// Build the pool and check out one connection so an unreachable store
    /// fails startup instead of the first request.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let store = Self {
            pool: pool::connect(database_url)?,
            connected: AtomicBool::new(false),
        };
        drop(store.checkout().await?);
        tracing::info!("aggregate store connected");
        Ok(store)
    }

    async fn checkout(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        let result = match time::timeout(SERVER_SELECTION_TIMEOUT, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(StoreError::Unavailable(err.to_string())),
            Err(_) => Err(StoreError::Timeout(SERVER_SELECTION_TIMEOUT)),
        };
        self.mark_connected(result.is_ok());
        result
    }

    fn mark_connected(&self, up: bool) {
        let was = self.connected.swap(up, Ordering::Relaxed);
        if was && !up {
            tracing::warn!("aggregate store connection lost");
        } else if !was && up {
            tracing::debug!("aggregate store reachable");
        }
    }
}

#[async_trait]
impl LeaderboardStore for PgLeaderboardStore {
    async fn read_top_n(&self, n: usize) -> Result<LeaderboardSnapshot, StoreError> {
        let mut conn = self.checkout().await?;

        let query = diesel_async::RunQueryDsl::load(
            country_clicks::table
                .order((country_clicks::clicks.desc(), country_clicks::country.asc()))
                .limit(i64::try_from(n).unwrap_or(i64::MAX))
                .select(CountryClicks::as_select()),
            &mut conn,
        );

        let rows: Vec<CountryClicks> = match time::timeout(QUERY_TIMEOUT, query).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                if matches!(
                    err,
                    diesel::result::Error::BrokenTransactionManager
                        | diesel::result::Error::DatabaseError(
                            diesel::result::DatabaseErrorKind::ClosedConnection,
                            _
                        )
                ) {
                    self.mark_connected(false);
                }
                return Err(StoreError::Unavailable(err.to_string()));
            }
            Err(_) => {
                self.mark_connected(false);
                return Err(StoreError::Timeout(QUERY_TIMEOUT));
            }
        };

        Ok(LeaderboardSnapshot::from_ranked(
            rows.into_iter().map(LeaderboardEntry::from).collect(),
        ))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// A checkout makes the pool recycle (and verify) an idle connection.
    async fn probe(&self) {
        if let Err(err) = self.checkout().await {
            tracing::debug!(%err, "aggregate store probe failed");
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (local runs / tests)
// ---------------------------------------------------------------------------

pub struct MemoryLeaderboardStore {
    rows: Mutex<HashMap<String, LeaderboardEntry>>,
    available: AtomicBool,
    reads: AtomicUsize,
    probes: AtomicUsize,
    read_delay: Mutex<Duration>,
}

impl MemoryLeaderboardStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            reads: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            read_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Add `clicks` to `key`, creating the row if needed. Returns the new score.
    pub fn record(&self, key: &str, clicks: u64) -> u64 {
        let mut rows = self.rows.lock();
        let entry = rows.entry(key.to_string()).or_insert_with(|| LeaderboardEntry {
            key: key.to_string(),
            score: 0,
            last_updated: Utc::now(),
        });
        entry.score = entry.score.saturating_add(clicks);
        entry.last_updated = Utc::now();
        entry.score
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Number of `read_top_n` calls so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    /// Make every read take `delay` before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }
}

impl Default for MemoryLeaderboardStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderboardStore for MemoryLeaderboardStore {
    async fn read_top_n(&self, n: usize) -> Result<LeaderboardSnapshot, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        if !self.is_connected() {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        let entries: Vec<LeaderboardEntry> = self.rows.lock().values().cloned().collect();
        Ok(LeaderboardSnapshot::ranked(entries, n))
    }

    fn is_connected(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }
}
