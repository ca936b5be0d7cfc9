//! HTTP long-polling fallback transport.
//!
//! `GET` without a `sid` performs the handshake; `GET ?sid=` waits for queued
//! frames; `POST ?sid=` delivers client frames; `DELETE ?sid=` closes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::error::ApiError;
use crate::AppState;

use super::events::{reply_to, ClientMessage, ServerEvent};
use super::heartbeat::{Liveness, PING_INTERVAL, PING_TIMEOUT};
use super::origin::OriginPolicy;
use super::registry::{ConnectionId, Transport};

/// Receiving side of one polling connection.
pub struct PollingSession {
    outbox: Mutex<mpsc::Receiver<Arc<ServerEvent>>>,
    liveness: parking_lot::Mutex<Liveness>,
}

impl PollingSession {
    fn touch(&self) {
        self.liveness.lock().touch();
    }
}

/// Outboxes of connections using the polling transport, keyed like the registry.
pub struct PollingSessions {
    sessions: DashMap<ConnectionId, Arc<PollingSession>>,
}

impl PollingSessions {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, id: ConnectionId, outbox: mpsc::Receiver<Arc<ServerEvent>>) {
        let session = PollingSession {
            outbox: Mutex::new(outbox),
            liveness: parking_lot::Mutex::new(Liveness::new()),
        };
        self.sessions.insert(id, Arc::new(session));
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<PollingSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove sessions that have not polled within the heartbeat timeout.
    /// Returns the ids removed.
    pub fn sweep_expired(&self, now: Instant) -> Vec<ConnectionId> {
        let expired: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().liveness.lock().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }
}

impl Default for PollingSessions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub sid: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub sid: String,
    pub upgrades: Vec<&'static str>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

/// One client frame or a batch of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientFrames {
    Batch(Vec<ClientMessage>),
    Single(ClientMessage),
}

/// `OPTIONS` is answered by the CORS layer before reaching the method router.
pub fn router(origins: &OriginPolicy) -> Router<AppState> {
    Router::new()
        .route(
            "/realtime/polling",
            get(poll)
                .post(push)
                .delete(close)
                .fallback(crate::routes::not_found),
        )
        .layer(origins.cors_layer())
}

// ---------------------------------------------------------------------------
// GET /realtime/polling
// ---------------------------------------------------------------------------

async fn poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Result<Response, ApiError> {
    match query.sid {
        None => handshake(&state, &headers).await,
        Some(sid) => long_poll(&state, ConnectionId::from_client(&sid)).await,
    }
}

async fn handshake(state: &AppState, headers: &HeaderMap) -> Result<Response, ApiError> {
    state.origins.check(headers)?;

    let (id, handle, outbox) = state.broadcaster.register(Transport::Polling);
    state.polling.insert(id.clone(), outbox);

    // The client may hang up while the initial snapshot is being read.
    let guard = HandshakeGuard {
        state,
        id: &id,
        armed: true,
    };
    state.broadcaster.send_initial(&id, &handle).await;
    guard.disarm();

    let body = HandshakeResponse {
        sid: id.to_string(),
        upgrades: vec![Transport::WebSocket.as_str()],
        ping_interval: PING_INTERVAL.as_millis() as u64,
        ping_timeout: PING_TIMEOUT.as_millis() as u64,
    };
    Ok(Json(body).into_response())
}

/// Unregisters a polling connection whose handshake never completed.
struct HandshakeGuard<'a> {
    state: &'a AppState,
    id: &'a ConnectionId,
    armed: bool,
}

impl HandshakeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(connection_id = %self.id, "polling handshake abandoned");
            self.state.polling.remove(self.id);
            self.state.broadcaster.disconnect(self.id);
        }
    }
}

async fn long_poll(state: &AppState, id: ConnectionId) -> Result<Response, ApiError> {
    let session = state
        .polling
        .get(&id)
        .ok_or_else(|| ApiError::bad_request("Session ID unknown"))?;
    session.touch();

    let Ok(mut outbox) = session.outbox.try_lock() else {
        return Err(ApiError::bad_request("Overlapping poll"));
    };

    let mut frames: Vec<Arc<ServerEvent>> = Vec::new();
    match time::timeout(PING_INTERVAL, outbox.recv()).await {
        Ok(Some(first)) => {
            frames.push(first);
            while let Ok(next) = outbox.try_recv() {
                frames.push(next);
            }
        }
        Ok(None) => {
            drop(outbox);
            state.polling.remove(&id);
            return Err(ApiError::bad_request("Session ID unknown"));
        }
        // Nothing queued within the probe interval; the empty reply doubles as a ping.
        Err(_) => {}
    }
    drop(outbox);
    session.touch();

    let body: Vec<&ServerEvent> = frames.iter().map(|event| event.as_ref()).collect();
    Ok(Json(body).into_response())
}

// ---------------------------------------------------------------------------
// POST /realtime/polling?sid=
// ---------------------------------------------------------------------------

async fn push(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = query
        .sid
        .map(|sid| ConnectionId::from_client(&sid))
        .ok_or_else(|| ApiError::bad_request("Session ID unknown"))?;
    let session = state
        .polling
        .get(&id)
        .ok_or_else(|| ApiError::bad_request("Session ID unknown"))?;
    let handle = state
        .registry
        .handle(&id)
        .ok_or_else(|| ApiError::bad_request("Session ID unknown"))?;
    session.touch();

    let frames = match serde_json::from_slice::<ClientFrames>(&body) {
        Ok(ClientFrames::Batch(frames)) => frames,
        Ok(ClientFrames::Single(frame)) => vec![frame],
        Err(_) => return Err(ApiError::bad_request("Invalid frame")),
    };

    for frame in &frames {
        if let Some(reply) = reply_to(frame) {
            if let Err(err) = handle.send(reply) {
                tracing::warn!(connection_id = %id, %err, "polling reply dropped");
            }
        }
    }

    Ok(Json(serde_json::json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// DELETE /realtime/polling?sid=
// ---------------------------------------------------------------------------

async fn close(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = query
        .sid
        .map(|sid| ConnectionId::from_client(&sid))
        .ok_or_else(|| ApiError::bad_request("Session ID unknown"))?;
    if !state.polling.remove(&id) {
        return Err(ApiError::bad_request("Session ID unknown"));
    }
    state.broadcaster.disconnect(&id);
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

/// Unregister polling connections that stopped polling. Returns how many.
pub fn reap_expired(state: &AppState) -> usize {
    let expired = state.polling.sweep_expired(Instant::now());
    for id in &expired {
        tracing::debug!(connection_id = %id, "polling heartbeat timeout");
        state.broadcaster.disconnect(id);
    }
    expired.len()
}

/// Run `reap_expired` every probe interval for the life of the process.
pub fn spawn_reaper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = time::interval(PING_INTERVAL);
        sweep.tick().await; // First tick fires immediately; skip it.
        loop {
            sweep.tick().await;
            let reaped = reap_expired(&state);
            if reaped > 0 {
                tracing::info!(reaped, "reaped stale polling connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_state;

    #[tokio::test(start_paused = true)]
    async fn reaper_unregisters_silent_polling_connections() {
        let state = test_state();
        let (ws_id, _ws_outbox) = state.broadcaster.connect(Transport::WebSocket).await;
        let (poll_id, outbox) = state.broadcaster.connect(Transport::Polling).await;
        state.polling.insert(poll_id.clone(), outbox);
        assert_eq!(state.registry.size(), 2);

        assert_eq!(reap_expired(&state), 0);

        time::advance(PING_TIMEOUT - Duration::from_secs(1)).await;
        state.polling.get(&poll_id).unwrap().touch();
        time::advance(PING_TIMEOUT - Duration::from_secs(1)).await;
        assert_eq!(reap_expired(&state), 0);

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(reap_expired(&state), 1);
        assert!(!state.registry.contains(&poll_id));
        assert!(state.registry.contains(&ws_id));
        assert!(state.polling.is_empty());
    }

    #[test]
    fn sweep_removes_only_stale_sessions() {
        let sessions = PollingSessions::new();
        let (_tx_a, rx_a) = mpsc::channel(1);
        let (_tx_b, rx_b) = mpsc::channel(1);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        sessions.insert(a.clone(), rx_a);
        sessions.insert(b.clone(), rx_b);

        assert!(sessions.sweep_expired(Instant::now()).is_empty());
        assert_eq!(sessions.len(), 2);

        let later = Instant::now() + PING_TIMEOUT + Duration::from_secs(1);
        let mut expired = sessions.sweep_expired(later);
        expired.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        let mut expected = vec![a, b];
        expected.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(expired, expected);
        assert!(sessions.is_empty());
    }

    #[test]
    fn client_frames_accept_single_or_batch() {
        let single: ClientFrames = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(matches!(single, ClientFrames::Single(_)));

        let batch: ClientFrames =
            serde_json::from_str(r#"[{"event":"ping"},{"event":"ping"}]"#).unwrap();
        match batch {
            ClientFrames::Batch(frames) => assert_eq!(frames.len(), 2),
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn remove_reports_presence() {
        let sessions = PollingSessions::new();
        let (_tx, rx) = mpsc::channel(1);
        let id = ConnectionId::new();
        sessions.insert(id.clone(), rx);
        assert!(sessions.remove(&id));
        assert!(!sessions.remove(&id));
    }
}
