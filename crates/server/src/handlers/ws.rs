// WebSocket change feed: every committed write is fanned out to the
// subscribers of its tenant and table.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use canteiro_core::{models::CollectionKind, realtime::ChangeEvent};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, RwLock};

use crate::{
    error::{AppError, Result},
    middleware::auth::decode_token,
    AppState,
};

// One fan-out channel per subscription key
pub struct FeedState {
    pub broadcast: broadcast::Sender<ChangeEvent>,
}

impl FeedState {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(256);
        Self { broadcast }
    }
}

impl Default for FeedState {
    fn default() -> Self {
        Self::new()
    }
}

// Feed registry - keyed by "tenant_id:table"
pub type FeedRegistry = Arc<RwLock<HashMap<String, Arc<FeedState>>>>;

pub fn create_feed_registry() -> FeedRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

fn feed_key(tenant_id: &str, table: CollectionKind) -> String {
    format!("{tenant_id}:{table}")
}

async fn feed(registry: &FeedRegistry, key: String) -> Arc<FeedState> {
    if let Some(existing) = registry.read().await.get(&key) {
        return Arc::clone(existing);
    }
    let mut registry = registry.write().await;
    Arc::clone(registry.entry(key).or_default())
}

/// Publishes to current subscribers; nobody listening is fine.
pub async fn publish(registry: &FeedRegistry, tenant_id: &str, event: ChangeEvent) {
    let key = feed_key(tenant_id, event.table);
    if let Some(feed) = registry.read().await.get(&key) {
        let _ = feed.broadcast.send(event);
    }
}

pub async fn publish_all(registry: &FeedRegistry, tenant_id: &str, events: Vec<ChangeEvent>) {
    for event in events {
        publish(registry, tenant_id, event).await;
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
    pub table: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response> {
    let user = decode_token(&query.token, &state.config.jwt_secret)?;
    let tenant_id = user.tenant()?.to_string();
    let table: CollectionKind = query.table.parse().map_err(AppError::Validation)?;

    // Subscribed before the handshake completes, so no commit after the
    // client sees the upgrade is missed
    let broadcast_rx = feed(&state.feeds, feed_key(&tenant_id, table))
        .await
        .broadcast
        .subscribe();
    tracing::debug!(user_id = %user.id, tenant_id = %tenant_id, table = %table, "Change feed opened");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, broadcast_rx)))
}

async fn handle_socket(socket: WebSocket, mut broadcast_rx: broadcast::Receiver<ChangeEvent>) {
    let (sender, mut receiver) = socket.split();

    // Sender wrapped in Arc<Mutex> for sharing
    let sender = Arc::new(tokio::sync::Mutex::new(sender));
    let sender_clone = sender.clone();

    // Task to forward change events to this client
    let broadcast_task = tokio::spawn(async move {
        loop {
            let event = match broadcast_rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change feed subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            let mut sender = sender_clone.lock().await;
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // The feed is push-only; the client only keeps the socket alive
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Close(_) => break,
            Message::Ping(data) => {
                let mut sender = sender.lock().await;
                let _ = sender.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    broadcast_task.abort();
}
