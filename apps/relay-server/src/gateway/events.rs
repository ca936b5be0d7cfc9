//! Realtime event names and wire-format frames.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`, in
//! both directions and on both transports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::leaderboard::LeaderboardSnapshot;

/// Message sent in place of an `initial` snapshot when the store read fails.
pub const FETCH_FAILED_MESSAGE: &str = "Failed to fetch leaderboard";

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Whether a leaderboard push is the per-connection snapshot or a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Initial,
    Update,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub leaderboard: LeaderboardSnapshot,
    #[serde(serialize_with = "relay_common::time::serialize_iso")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PongPayload {
    #[serde(serialize_with = "relay_common::time::serialize_iso")]
    pub timestamp: DateTime<Utc>,
}

/// A frame sent from the server to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    LeaderboardUpdate(LeaderboardUpdate),
    Error(ErrorPayload),
    Pong(PongPayload),
}

impl ServerEvent {
    /// Per-connection snapshot sent right after the handshake.
    pub fn initial(snapshot: LeaderboardSnapshot) -> Self {
        Self::leaderboard(UpdateKind::Initial, snapshot)
    }

    /// Snapshot fanned out to every connection.
    pub fn update(snapshot: LeaderboardSnapshot) -> Self {
        Self::leaderboard(UpdateKind::Update, snapshot)
    }

    fn leaderboard(kind: UpdateKind, snapshot: LeaderboardSnapshot) -> Self {
        Self::LeaderboardUpdate(LeaderboardUpdate {
            kind,
            leaderboard: snapshot,
            timestamp: Utc::now(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn pong() -> Self {
        Self::Pong(PongPayload {
            timestamp: Utc::now(),
        })
    }

    /// The leaderboard kind, if this is a leaderboard push.
    pub fn update_kind(&self) -> Option<UpdateKind> {
        match self {
            Self::LeaderboardUpdate(update) => Some(update.kind),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A frame received from a client.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Client event names the server reacts to.
pub struct ClientEventName;

impl ClientEventName {
    pub const PING: &'static str = "ping";
}

/// Compute the reply to a client frame, if any. Unknown events are ignored.
pub fn reply_to(msg: &ClientMessage) -> Option<ServerEvent> {
    match msg.event.as_str() {
        ClientEventName::PING => Some(ServerEvent::pong()),
        other => {
            tracing::debug!(event = %other, "ignoring unknown client event");
            None
        }
    }
}
