//! WebSocket push channel
//!
//! `GET /ws?mode=30` upgrades and subscribes the connection to one mode. The
//! client can switch modes with `{"type":"subscribe","mode":"60"}` and probe
//! with `{"type":"ping"}`. A snapshot is sent on subscribe and whenever the
//! connection lagged behind the broadcast channel.

use super::handlers::AppState;
use crate::broadcast::{GameEvent, ModeSnapshot, PersonalFeed, Subscription};
use crate::engine::GameEngine;
use crate::games::types::{BettorId, ModeId};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

/// Messages a client may send
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { mode: ModeId },
    Ping,
}

/// Control replies; game events are sent as [`GameEvent`] directly
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Snapshot { snapshot: ModeSnapshot },
    Pong { timestamp: i64 },
    Error { code: String, message: String },
}

/// GET /ws?mode={mode}
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let bettor = state.identity.resolve(&headers);
    let engine = Arc::clone(&state.engine);
    let mode = query.mode.map(ModeId::new);
    ws.on_upgrade(move |socket| handle_connection(socket, engine, mode, bettor))
}

type WsSender = SplitSink<WebSocket, Message>;

async fn handle_connection(socket: WebSocket, engine: Arc<GameEngine>, mode: Option<ModeId>, bettor: Option<BettorId>) {
    let client_id = next_client_id();
    info!(client = %client_id, mode = ?mode, bettor = ?bettor, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut personal: Option<PersonalFeed> = bettor.as_ref().map(|b| engine.hub().subscribe_bettor(b));
    let mut subscription: Option<Subscription> = None;

    if let Some(mode) = mode {
        match subscribe(&engine, &mut sender, &mode).await {
            Ok(sub) => subscription = sub,
            Err(_) => return,
        }
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(client = %client_id, error = %e, "WebSocket receive error");
                        break;
                    }
                };
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Subscribe { mode }) => {
                        // Drop the old subscription first so viewer counts stay exact
                        drop(subscription.take());
                        match subscribe(&engine, &mut sender, &mode).await {
                            Ok(sub) => {
                                subscription = sub;
                                continue;
                            }
                            Err(_) => break,
                        }
                    }
                    Ok(ClientMessage::Ping) => ControlMessage::Pong { timestamp: Utc::now().timestamp() },
                    Err(e) => ControlMessage::Error {
                        code: "BAD_MESSAGE".to_string(),
                        message: e.to_string(),
                    },
                };
                if send_json(&mut sender, &reply).await.is_err() {
                    break;
                }
            }
            event = recv_mode(&mut subscription) => {
                match event {
                    Ok(event) => {
                        if send_json(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let Some(mode) = subscription.as_ref().map(|s| s.mode().clone()) else {
                            continue;
                        };
                        warn!(client = %client_id, mode = %mode, skipped, "Client lagged, resyncing");
                        if send_snapshot(&engine, &mut sender, &mode).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => subscription = None,
                }
            }
            event = recv_personal(&mut personal) => {
                match event {
                    Ok(event) => {
                        if send_json(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    // Missed notifications are still visible via /api/wagers/mine
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => personal = None,
                }
            }
        }
    }

    info!(client = %client_id, "WebSocket client disconnected");
}

/// Subscribe to `mode` and send its snapshot. `Err` means the socket is gone.
async fn subscribe(engine: &GameEngine, sender: &mut WsSender, mode: &ModeId) -> Result<Option<Subscription>, ()> {
    let Some(subscription) = engine.hub().subscribe(mode) else {
        let error = ControlMessage::Error {
            code: "UNKNOWN_MODE".to_string(),
            message: format!("Unknown game mode: {}", mode),
        };
        return send_json(sender, &error).await.map(|_| None);
    };
    send_snapshot(engine, sender, mode).await?;
    Ok(Some(subscription))
}

async fn send_snapshot(engine: &GameEngine, sender: &mut WsSender, mode: &ModeId) -> Result<(), ()> {
    match engine.state(mode) {
        Some(snapshot) => send_json(sender, &ControlMessage::Snapshot { snapshot }).await,
        None => Ok(()),
    }
}

async fn send_json<T: Serialize>(sender: &mut WsSender, message: &T) -> Result<(), ()> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize WebSocket message");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

async fn recv_mode(subscription: &mut Option<Subscription>) -> Result<GameEvent, RecvError> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_personal(feed: &mut Option<PersonalFeed>) -> Result<GameEvent, RecvError> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("ws_{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}
