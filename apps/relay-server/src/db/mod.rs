pub mod leaderboard;
pub mod pool;
pub mod schema;
