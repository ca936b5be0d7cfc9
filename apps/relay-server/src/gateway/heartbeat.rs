//! Transport-level liveness tracking shared by both transports.

use std::time::Duration;

use tokio::time::Instant;

/// How often the server probes a peer (WebSocket ping / polling reaper sweep).
pub const PING_INTERVAL: Duration = Duration::from_secs(25);

/// A peer silent for longer than this is considered dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Last time a peer showed any sign of life.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    last_seen: Instant,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Whether the peer missed the deadline as of `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > PING_TIMEOUT
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
