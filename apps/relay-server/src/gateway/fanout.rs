//! Leaderboard fan-out: per-connection initial snapshots and broadcasts to
//! every registered connection.
//!
//! Each send is a non-blocking push into the connection's outbox, so one dead
//! or slow client never holds up the rest of a broadcast.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::db::leaderboard::{LeaderboardStore, StoreError};

use super::events::{ServerEvent, FETCH_FAILED_MESSAGE};
use super::registry::{
    ClientConnection, ConnectionHandle, ConnectionId, ConnectionRegistry, Transport,
};

/// Outcome of a single `broadcast_to_all` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Connections a send was attempted on.
    pub attempted: usize,
    /// Sends that were queued (or held until the connection's initial snapshot).
    pub delivered: usize,
    pub failed: usize,
}

/// Owns the path from the aggregate store to connected clients.
///
/// Cloneable handles are shared through `AppState`; the trigger endpoint and
/// both transports all go through this type.
pub struct LeaderboardBroadcaster {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn LeaderboardStore>,
    top_n: usize,
}

impl LeaderboardBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn LeaderboardStore>, top_n: usize) -> Self {
        Self {
            registry,
            store,
            top_n,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection and queue its initial snapshot.
    ///
    /// Returns the connection id and the outbox the transport must drain.
    pub async fn connect(
        &self,
        transport: Transport,
    ) -> (ConnectionId, mpsc::Receiver<Arc<ServerEvent>>) {
        let (id, handle, outbox) = self.register(transport);
        self.send_initial(&id, &handle).await;
        (id, outbox)
    }

    /// Register a new connection without reading the store.
    ///
    /// Callers that can be cancelled must make the id reachable by their own
    /// cleanup before awaiting `send_initial`.
    pub fn register(
        &self,
        transport: Transport,
    ) -> (ConnectionId, ConnectionHandle, mpsc::Receiver<Arc<ServerEvent>>) {
        let (handle, outbox) = ConnectionHandle::channel();
        let id = ConnectionId::new();
        self.registry
            .register(ClientConnection::new(id.clone(), transport, handle.clone()));

        tracing::info!(
            connection_id = %id,
            transport = transport.as_str(),
            connected = self.registry.size(),
            "client connected"
        );
        (id, handle, outbox)
    }

    /// Remove a connection from the registry. Safe to call more than once.
    pub fn disconnect(&self, id: &ConnectionId) {
        if let Some(connection) = self.registry.unregister(id) {
            tracing::info!(
                connection_id = %id,
                transport = connection.transport.as_str(),
                session_secs = (chrono::Utc::now() - connection.connected_at).num_seconds(),
                connected = self.registry.size(),
                "client disconnected"
            );
        }
    }

    /// Read a fresh snapshot and queue it as this connection's `initial` event.
    /// A failed read becomes an `error` event; the connection stays open.
    pub async fn send_initial(&self, id: &ConnectionId, handle: &ConnectionHandle) {
        let first = match self.store.read_top_n(self.top_n).await {
            Ok(snapshot) => ServerEvent::initial(snapshot),
            Err(err) => {
                tracing::error!(connection_id = %id, %err, "failed to read initial leaderboard");
                ServerEvent::error(FETCH_FAILED_MESSAGE)
            }
        };
        if let Err(err) = handle.prime(first) {
            tracing::debug!(connection_id = %id, %err, "initial leaderboard not delivered");
        }
    }

    /// Send `event` to every registered connection. Failures are isolated per
    /// connection and only logged; dead connections are reaped by the heartbeat.
    pub fn broadcast_to_all(&self, event: ServerEvent) -> FanoutReport {
        let event = Arc::new(event);
        let mut report = FanoutReport::default();

        self.registry.for_each(|connection| {
            report.attempted += 1;
            match connection.handle.deliver(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        connection_id = %connection.id,
                        %err,
                        "broadcast send failed"
                    );
                }
            }
        });

        report
    }

    /// Re-read the leaderboard and push an `update` to everyone.
    ///
    /// A failed read broadcasts nothing.
    pub async fn broadcast_update(&self) -> Result<FanoutReport, StoreError> {
        let snapshot = self.store.read_top_n(self.top_n).await?;
        let rows = snapshot.len();
        let report = self.broadcast_to_all(ServerEvent::update(snapshot));

        tracing::info!(
            rows,
            recipients = report.delivered,
            failed = report.failed,
            "leaderboard update broadcast"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::leaderboard::MemoryLeaderboardStore;
    use crate::gateway::events::UpdateKind;

    fn setup() -> (LeaderboardBroadcaster, Arc<MemoryLeaderboardStore>) {
        let store = Arc::new(MemoryLeaderboardStore::new());
        let broadcaster =
            LeaderboardBroadcaster::new(Arc::new(ConnectionRegistry::new()), store.clone(), 20);
        (broadcaster, store)
    }

    fn leaderboard_keys(event: &ServerEvent) -> Vec<String> {
        match event {
            ServerEvent::LeaderboardUpdate(update) => update
                .leaderboard
                .entries()
                .iter()
                .map(|e| e.key.clone())
                .collect(),
            other => panic!("expected leaderboard update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_registers_and_queues_initial() {
        let (broadcaster, store) = setup();
        store.record("JP", 5);

        let (id, mut outbox) = broadcaster.connect(Transport::WebSocket).await;
        assert!(broadcaster.registry().contains(&id));

        let first = outbox.recv().await.unwrap();
        assert_eq!(first.update_kind(), Some(UpdateKind::Initial));
        assert_eq!(leaderboard_keys(&first), vec!["JP"]);
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn initial_failure_sends_error_and_keeps_connection() {
        let (broadcaster, store) = setup();
        store.set_available(false);

        let (id, mut outbox) = broadcaster.connect(Transport::Polling).await;
        assert!(broadcaster.registry().contains(&id));

        match outbox.recv().await.unwrap().as_ref() {
            ServerEvent::Error(payload) => assert_eq!(payload.message, FETCH_FAILED_MESSAGE),
            other => panic!("expected error event, got {other:?}"),
        }

        store.set_available(true);
        broadcaster.broadcast_update().await.unwrap();
        let next = outbox.recv().await.unwrap();
        assert_eq!(next.update_kind(), Some(UpdateKind::Update));
    }

    #[tokio::test]
    async fn broadcast_attempts_every_connection() {
        let (broadcaster, _store) = setup();
        let mut outboxes = Vec::new();
        for _ in 0..3 {
            outboxes.push(broadcaster.connect(Transport::WebSocket).await.1);
        }

        let report = broadcaster.broadcast_to_all(ServerEvent::update(Default::default()));
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 3);

        for outbox in &mut outboxes {
            assert_eq!(outbox.recv().await.unwrap().update_kind(), Some(UpdateKind::Initial));
            assert_eq!(outbox.recv().await.unwrap().update_kind(), Some(UpdateKind::Update));
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_connections_is_noop() {
        let (broadcaster, _store) = setup();
        let report = broadcaster.broadcast_to_all(ServerEvent::update(Default::default()));
        assert_eq!(report, FanoutReport::default());
    }

    #[tokio::test]
    async fn failed_send_does_not_stop_the_rest() {
        let (broadcaster, _store) = setup();
        let (_a, mut rx_a) = broadcaster.connect(Transport::WebSocket).await;
        let (_b, rx_b) = broadcaster.connect(Transport::WebSocket).await;
        let (_c, mut rx_c) = broadcaster.connect(Transport::Polling).await;
        drop(rx_b);

        let report = broadcaster.broadcast_to_all(ServerEvent::update(Default::default()));
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);

        for rx in [&mut rx_a, &mut rx_c] {
            assert_eq!(rx.recv().await.unwrap().update_kind(), Some(UpdateKind::Initial));
            assert_eq!(rx.recv().await.unwrap().update_kind(), Some(UpdateKind::Update));
        }
    }

    #[tokio::test]
    async fn broadcast_update_reads_once_and_ranks() {
        let (broadcaster, store) = setup();
        let (_id, mut outbox) = broadcaster.connect(Transport::WebSocket).await;
        let _initial = outbox.recv().await.unwrap();

        store.record("A", 50);
        store.record("B", 200);
        store.record("C", 75);
        let reads_before = store.reads();

        let report = broadcaster.broadcast_update().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(store.reads(), reads_before + 1);

        let update = outbox.recv().await.unwrap();
        assert_eq!(update.update_kind(), Some(UpdateKind::Update));
        assert_eq!(leaderboard_keys(&update), vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn broadcast_update_store_failure_sends_nothing() {
        let (broadcaster, store) = setup();
        let (_id, mut outbox) = broadcaster.connect(Transport::WebSocket).await;
        let _initial = outbox.recv().await.unwrap();

        store.set_available(false);
        assert!(broadcaster.broadcast_update().await.is_err());
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_racing_the_handshake_arrives_after_initial() {
        let (broadcaster, store) = setup();
        let (id, handle, mut outbox) = broadcaster.register(Transport::WebSocket);
        assert!(broadcaster.registry().contains(&id));
        assert_eq!(store.reads(), 0);

        // A trigger lands between registration and the initial read.
        let report = broadcaster.broadcast_to_all(ServerEvent::update(Default::default()));
        assert_eq!(report.delivered, 1);

        broadcaster.send_initial(&id, &handle).await;
        assert_eq!(outbox.recv().await.unwrap().update_kind(), Some(UpdateKind::Initial));
        assert_eq!(outbox.recv().await.unwrap().update_kind(), Some(UpdateKind::Update));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (broadcaster, _store) = setup();
        let (id, _outbox) = broadcaster.connect(Transport::WebSocket).await;
        broadcaster.disconnect(&id);
        broadcaster.disconnect(&id);
        assert_eq!(broadcaster.registry().size(), 0);
    }
}
