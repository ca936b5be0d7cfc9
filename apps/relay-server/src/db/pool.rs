use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

use super::leaderboard::StoreError;

pub type DbPool = Pool<AsyncPgConnection>;

const MAX_POOL_SIZE: usize = 10;

/// Create a Diesel async connection pool. No connection is opened yet.
pub fn connect(database_url: &str) -> Result<DbPool, StoreError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(MAX_POOL_SIZE)
        .build()
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;

    tracing::info!(max_size = MAX_POOL_SIZE, "database pool created");

    Ok(pool)
}
