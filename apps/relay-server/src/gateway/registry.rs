//! Registry of live realtime connections, independent of the transport.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_common::id::{prefix, PrefixedId};
use thiserror::Error;
use tokio::sync::mpsc;

use super::events::ServerEvent;

/// Frames a connection may have queued before it is considered stalled.
pub const OUTBOX_CAPACITY: usize = 64;

/// Opaque connection key (`conn_` prefixed ULID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl PrefixedId for ConnectionId {
    const PREFIX: &'static str = prefix::CONNECTION;
}

impl ConnectionId {
    pub fn new() -> Self {
        Self(<Self as PrefixedId>::generate())
    }

    /// Rebuild a key received from a client (polling `sid`).
    pub fn from_client(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    Polling,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("outbox full")]
    Full,
}

impl<T> From<mpsc::error::TrySendError<T>> for TransportError {
    fn from(err: mpsc::error::TrySendError<T>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => Self::Full,
            mpsc::error::TrySendError::Closed(_) => Self::Closed,
        }
    }
}

#[derive(Default)]
struct Gate {
    primed: bool,
    held: Vec<Arc<ServerEvent>>,
}

/// Sending half of a connection's outbox.
///
/// Broadcasts reaching a connection before its first snapshot was queued are
/// held back and flushed right after it, so `initial` always comes first.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Arc<ServerEvent>>,
    gate: Arc<Mutex<Gate>>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end the transport drains.
    pub fn channel() -> (Self, mpsc::Receiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let handle = Self {
            tx,
            gate: Arc::new(Mutex::new(Gate::default())),
        };
        (handle, rx)
    }

    /// Queue the first snapshot (or its error) and release held broadcasts.
    ///
    /// The result reflects the first frame only. Held broadcasts that no longer
    /// fit are dropped and logged; the rest are still queued in order.
    pub fn prime(&self, first: ServerEvent) -> Result<(), TransportError> {
        let mut gate = self.gate.lock();
        let result = self.tx.try_send(Arc::new(first)).map_err(TransportError::from);
        gate.primed = true;

        let mut dropped = 0usize;
        let mut last_err = None;
        for event in gate.held.drain(..) {
            if let Err(err) = self.tx.try_send(event) {
                dropped += 1;
                last_err = Some(TransportError::from(err));
            }
        }
        if let Some(err) = last_err {
            tracing::warn!(dropped, %err, "held broadcasts dropped while priming");
        }
        result
    }

    /// Queue a broadcast frame, holding it if the connection is not primed yet.
    pub fn deliver(&self, event: Arc<ServerEvent>) -> Result<(), TransportError> {
        let mut gate = self.gate.lock();
        if !gate.primed {
            if gate.held.len() >= OUTBOX_CAPACITY {
                return Err(TransportError::Full);
            }
            gate.held.push(event);
            return Ok(());
        }
        self.tx.try_send(event).map_err(TransportError::from)
    }

    /// Queue a direct reply (e.g. `pong`), bypassing the initial-first gate.
    pub fn send(&self, event: ServerEvent) -> Result<(), TransportError> {
        self.tx.try_send(Arc::new(event)).map_err(TransportError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A registered client connection.
#[derive(Clone)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub transport: Transport,
    pub connected_at: DateTime<Utc>,
    pub handle: ConnectionHandle,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, transport: Transport, handle: ConnectionHandle) -> Self {
        Self {
            id,
            transport,
            connected_at: Utc::now(),
            handle,
        }
    }
}

/// Live set of connections, shared by both transports and the fan-out.
///
/// Uses `DashMap` for shard-level concurrency; iteration works on a
/// point-in-time copy so callbacks may register or unregister freely.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ClientConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Add a connection. Re-registering an id replaces the previous entry.
    pub fn register(&self, connection: ClientConnection) {
        self.connections.insert(connection.id.clone(), connection);
    }

    /// Remove a connection. Unknown ids are a no-op.
    pub fn unregister(&self, id: &ConnectionId) -> Option<ClientConnection> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    pub fn handle(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Invoke `f` once for every connection registered at call time.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ClientConnection),
    {
        let snapshot: Vec<ClientConnection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in &snapshot {
            f(connection);
        }
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::UpdateKind;
    use crate::models::leaderboard::LeaderboardSnapshot;

    fn connection() -> (ClientConnection, mpsc::Receiver<Arc<ServerEvent>>) {
        let (handle, rx) = ConnectionHandle::channel();
        (
            ClientConnection::new(ConnectionId::new(), Transport::WebSocket, handle),
            rx,
        )
    }

    #[test]
    fn connection_ids_are_prefixed_and_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert!(a.as_str().starts_with("conn_"));
        assert_ne!(a, b);
    }

    #[test]
    fn register_and_size() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();
        registry.register(a.clone());
        registry.register(b);
        assert_eq!(registry.size(), 2);
        assert!(registry.contains(&a.id));
    }

    #[test]
    fn register_same_id_overwrites() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = connection();
        registry.register(a.clone());
        let (handle, _rx2) = ConnectionHandle::channel();
        registry.register(ClientConnection::new(a.id.clone(), Transport::Polling, handle));
        assert_eq!(registry.size(), 1);

        let mut transports = Vec::new();
        registry.for_each(|c| transports.push(c.transport));
        assert_eq!(transports, vec![Transport::Polling]);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();
        registry.register(a.clone());
        registry.register(b);

        assert!(registry.unregister(&a.id).is_some());
        assert_eq!(registry.size(), 1);
        assert!(registry.unregister(&a.id).is_none());
        assert_eq!(registry.size(), 1);
        assert!(registry.unregister(&ConnectionId::new()).is_none());
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn for_each_visits_every_connection_once() {
        let registry = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for _ in 0..5 {
            let (c, rx) = connection();
            registry.register(c);
            keep.push(rx);
        }
        let mut seen = std::collections::HashSet::new();
        let mut calls = 0;
        registry.for_each(|c| {
            calls += 1;
            seen.insert(c.id.clone());
        });
        assert_eq!(calls, 5);
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn for_each_on_empty_registry_is_noop() {
        let registry = ConnectionRegistry::new();
        let mut calls = 0;
        registry.for_each(|_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn for_each_tolerates_mutation_during_iteration() {
        let registry = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for _ in 0..4 {
            let (c, rx) = connection();
            registry.register(c);
            keep.push(rx);
        }

        let mut calls = 0;
        registry.for_each(|c| {
            calls += 1;
            registry.unregister(&c.id);
            let (fresh, _rx) = connection();
            registry.register(fresh);
        });
        assert_eq!(calls, 4);
        assert_eq!(registry.size(), 4);
    }

    #[tokio::test]
    async fn deliver_holds_until_primed() {
        let (handle, mut rx) = ConnectionHandle::channel();
        handle
            .deliver(Arc::new(ServerEvent::update(LeaderboardSnapshot::default())))
            .unwrap();
        assert!(rx.try_recv().is_err());

        handle
            .prime(ServerEvent::initial(LeaderboardSnapshot::default()))
            .unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.update_kind(), Some(UpdateKind::Initial));
        assert_eq!(second.update_kind(), Some(UpdateKind::Update));
    }

    #[tokio::test]
    async fn prime_keeps_flushing_after_a_held_send_fails() {
        let (handle, mut rx) = ConnectionHandle::channel();
        // A pong queued during the handshake takes one outbox slot.
        handle.send(ServerEvent::pong()).unwrap();
        for _ in 0..OUTBOX_CAPACITY {
            handle
                .deliver(Arc::new(ServerEvent::update(LeaderboardSnapshot::default())))
                .unwrap();
        }
        assert_eq!(
            handle.deliver(Arc::new(ServerEvent::update(LeaderboardSnapshot::default()))),
            Err(TransportError::Full)
        );

        assert!(handle
            .prime(ServerEvent::initial(LeaderboardSnapshot::default()))
            .is_ok());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.update_kind());
        }
        assert_eq!(kinds.len(), OUTBOX_CAPACITY);
        assert_eq!(kinds[0], None);
        assert_eq!(kinds[1], Some(UpdateKind::Initial));
        assert!(kinds[2..].iter().all(|k| *k == Some(UpdateKind::Update)));
    }

    #[test]
    fn prime_on_closed_outbox_reports_closed() {
        let (handle, rx) = ConnectionHandle::channel();
        handle
            .deliver(Arc::new(ServerEvent::update(LeaderboardSnapshot::default())))
            .unwrap();
        drop(rx);
        assert_eq!(
            handle.prime(ServerEvent::initial(LeaderboardSnapshot::default())),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn send_reports_closed_outbox() {
        let (handle, rx) = ConnectionHandle::channel();
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.send(ServerEvent::pong()), Err(TransportError::Closed));
    }

    #[test]
    fn deliver_reports_full_outbox() {
        let (handle, _rx) = ConnectionHandle::channel();
        handle
            .prime(ServerEvent::initial(LeaderboardSnapshot::default()))
            .unwrap();
        for _ in 1..OUTBOX_CAPACITY {
            handle.send(ServerEvent::pong()).unwrap();
        }
        let result = handle.deliver(Arc::new(ServerEvent::update(LeaderboardSnapshot::default())));
        assert_eq!(result, Err(TransportError::Full));
    }
}
