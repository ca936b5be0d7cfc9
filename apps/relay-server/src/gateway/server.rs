//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::AppState;

use super::events::{reply_to, ClientMessage, ServerEvent};
use super::heartbeat::{Liveness, PING_INTERVAL};
use super::registry::{ConnectionId, Transport};

/// Close codes (4000-range for application-level).
const CLOSE_INVALID_FRAME: u16 = 4000;
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/realtime/websocket",
        get(ws_upgrade).fallback(crate::routes::not_found),
    )
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Err(err) = state.origins.check(&headers) {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    serve_connection(&state, ws_tx, ws_rx).await;
}

/// Register, run until the peer leaves or goes silent, then unregister.
async fn serve_connection<S, R>(state: &AppState, ws_tx: S, ws_rx: R)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (id, outbox) = state.broadcaster.connect(Transport::WebSocket).await;
    run_connection(&id, ws_tx, ws_rx, outbox).await;
    state.broadcaster.disconnect(&id);
}

/// Main loop: forward queued frames, answer client events, enforce heartbeat.
async fn run_connection<S, R>(
    id: &ConnectionId,
    mut ws_tx: S,
    mut ws_rx: R,
    mut outbox: mpsc::Receiver<Arc<ServerEvent>>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut liveness = Liveness::new();
    let mut probe = time::interval(PING_INTERVAL);
    probe.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        liveness.touch();
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_INVALID_FRAME, "Invalid JSON").await;
                                break;
                            }
                        };
                        if let Some(reply) = reply_to(&client_msg) {
                            if send_event(&mut ws_tx, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => liveness.touch(),
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %id, "ws read error");
                        break;
                    }
                }
            }

            // Frame queued by the fan-out or the initial snapshot.
            event = outbox.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut ws_tx, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Heartbeat probe and deadline check.
            _ = probe.tick() => {
                if liveness.is_expired() {
                    tracing::debug!(connection_id = %id, "heartbeat timeout, closing connection");
                    let _ = send_close(&mut ws_tx, CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send_event<S>(ws_tx: &mut S, event: &ServerEvent) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    let json = match event.to_json() {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(%err, "failed to encode server event");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close<S>(ws_tx: &mut S, code: u16, reason: &str) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
