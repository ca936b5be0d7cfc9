use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::country_clicks;

/// A row of the aggregate table, owned by the write path.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = country_clicks)]
pub struct CountryClicks {
    pub country: String,
    pub clicks: i64,
    pub updated_at: DateTime<Utc>,
}

/// One ranked row as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// Grouping dimension, unique within the store (country code).
    pub key: String,
    pub score: u64,
    #[serde(serialize_with = "relay_common::time::serialize_iso")]
    #[schema(value_type = String, format = DateTime)]
    pub last_updated: DateTime<Utc>,
}

impl From<CountryClicks> for LeaderboardEntry {
    fn from(row: CountryClicks) -> Self {
        Self {
            key: row.country,
            score: row.clicks.max(0) as u64,
            last_updated: row.updated_at,
        }
    }
}

/// Immutable top-N view of the leaderboard, highest score first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LeaderboardSnapshot {
    entries: Vec<LeaderboardEntry>,
}

impl LeaderboardSnapshot {
    /// Rank `entries` by score (descending, ties by key) and keep the first `n`.
    pub fn ranked(mut entries: Vec<LeaderboardEntry>, n: usize) -> Self {
        entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
        entries.truncate(n);
        Self { entries }
    }

    /// Wrap rows that the store already returned in rank order.
    pub fn from_ranked(entries: Vec<LeaderboardEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[LeaderboardEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
