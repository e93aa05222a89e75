//! Realtime change feed over WebSocket
//!
//! One socket is shared by every subscription. Each [`Topic`] becomes a
//! channel joined with row-change filters; incoming `postgres_changes` frames
//! are decoded into [`ChangeEvent`]s and fanned out to every subscriber of
//! that channel.

use super::{Subscription, MESSAGES_TABLE, PRESENCE_TABLE, REACTIONS_TABLE, TYPING_TABLE};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

struct Route {
    id: u64,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

/// Subscribers of one socket, grouped by channel. A channel is joined when
/// its first subscriber arrives and left when its last one stops.
#[derive(Default)]
struct RouteTable {
    closed: bool,
    channels: HashMap<String, Vec<Route>>,
}

impl RouteTable {
    fn dispatch(&mut self, channel: &str, event: ChangeEvent) {
        if let Some(routes) = self.channels.get_mut(channel) {
            routes.retain(|route| route.events.send(event.clone()).is_ok());
        }
    }

    /// Returns true when `id` was the channel's last subscriber.
    fn detach(&mut self, channel: &str, id: u64) -> bool {
        let Some(routes) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = routes.len();
        routes.retain(|route| route.id != id);
        if routes.len() == before || !routes.is_empty() {
            return false;
        }
        self.channels.remove(channel);
        true
    }

    /// Dropping every route ends the subscribers' feeds.
    fn close(&mut self) {
        self.closed = true;
        self.channels.clear();
    }
}

#[derive(Clone)]
struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    routes: Arc<Mutex<RouteTable>>,
}

pub struct RealtimeClient {
    url: String,
    heartbeat: Duration,
    connection: Arc<Mutex<Option<Connection>>>,
    token: Mutex<Option<String>>,
    next_ref: Arc<AtomicU64>,
    next_route: AtomicU64,
}

impl RealtimeClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            url: config.realtime_url(),
            heartbeat: config.timing.heartbeat(),
            connection: Arc::new(Mutex::new(None)),
            token: Mutex::new(None),
            next_ref: Arc::new(AtomicU64::new(1)),
            next_route: AtomicU64::new(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .map(|conn| !conn.outbound.is_closed())
            .unwrap_or(false)
    }

    /// Token sent with every join. Channels already joined get it pushed right away.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.token.lock() = token.clone();

        let Some(token) = token else { return };
        let Some(conn) = self.connection.lock().clone() else {
            return;
        };
        let channels: Vec<String> = conn.routes.lock().channels.keys().cloned().collect();
        for channel in channels {
            let frame = json!({
                "topic": channel,
                "event": "access_token",
                "payload": { "access_token": token },
                "ref": self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
            });
            let _ = conn.outbound.send(frame.to_string());
        }
    }

    async fn ensure_connected(&self) -> Result<Connection> {
        if let Some(conn) = self.connection.lock().as_ref() {
            if !conn.outbound.is_closed() {
                return Ok(conn.clone());
            }
        }

        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let conn = Connection {
            outbound: tx.clone(),
            routes: Arc::new(Mutex::new(RouteTable::default())),
        };

        tracing::info!("Realtime socket connected");

        // Receive task
        let routes = conn.routes.clone();
        let current = self.connection.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if let Some((channel, event)) = decode_frame(&text) {
                            routes.lock().dispatch(&channel, event);
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            tracing::warn!("Realtime socket closed");
            {
                let mut current = current.lock();
                let same = current
                    .as_ref()
                    .map(|conn| Arc::ptr_eq(&conn.routes, &routes))
                    .unwrap_or(false);
                if same {
                    *current = None;
                }
            }
            routes.lock().close();
        });

        // Heartbeat task
        let heartbeat_tx = tx.clone();
        let next_ref = self.next_ref.clone();
        let period = self.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": next_ref.fetch_add(1, Ordering::Relaxed).to_string()
                });
                if heartbeat_tx.send(frame.to_string()).is_err() {
                    break;
                }
            }
        });

        // Send task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(WsMessage::Text(msg)).await.is_err() {
                    break;
                }
            }
        });

        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let conn = self.ensure_connected().await?;
        let channel = format!("realtime:{}", topic.channel_name());
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let first = {
            let mut table = conn.routes.lock();
            if table.closed {
                return Err(Error::Realtime("socket closed before join".to_string()));
            }
            let routes = table.channels.entry(channel.clone()).or_default();
            routes.push(Route { id, events: events_tx });
            routes.len() == 1
        };

        if first {
            let mut payload = json!({ "config": { "postgres_changes": change_filters(&topic) } });
            if let Some(token) = self.token.lock().as_deref() {
                payload["access_token"] = json!(token);
            }
            let join = json!({
                "topic": channel,
                "event": "phx_join",
                "payload": payload,
                "ref": self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
            });
            if conn.outbound.send(join.to_string()).is_err() {
                conn.routes.lock().detach(&channel, id);
                return Err(Error::Realtime("socket closed before join".to_string()));
            }
            tracing::debug!("Joined {}", channel);
        }

        let next_ref = self.next_ref.clone();
        Ok(Subscription::new(topic, events_rx, move || {
            if !conn.routes.lock().detach(&channel, id) {
                return;
            }
            let leave = json!({
                "topic": channel,
                "event": "phx_leave",
                "payload": {},
                "ref": next_ref.fetch_add(1, Ordering::Relaxed).to_string()
            });
            let _ = conn.outbound.send(leave.to_string());
        }))
    }
}

fn change_filters(topic: &Topic) -> Value {
    match topic {
        Topic::Conversation(id) => json!([
            {
                "event": "*",
                "schema": "public",
                "table": MESSAGES_TABLE,
                "filter": format!("conversation_id=eq.{}", id)
            },
            { "event": "*", "schema": "public", "table": REACTIONS_TABLE },
            {
                "event": "*",
                "schema": "public",
                "table": TYPING_TABLE,
                "filter": format!("conversation_id=eq.{}", id)
            }
        ]),
        Topic::Presence(user_id) => json!([
            {
                "event": "*",
                "schema": "public",
                "table": PRESENCE_TABLE,
                "filter": format!("user_id=eq.{}", user_id)
            }
        ]),
    }
}

/// Decodes one socket frame into its channel name and change event.
pub(crate) fn decode_frame(text: &str) -> Option<(String, ChangeEvent)> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame["event"] != "postgres_changes" {
        return None;
    }
    let channel = frame["topic"].as_str()?.to_string();
    let data = &frame["payload"]["data"];
    let table = data["table"].as_str()?;
    let kind = data["type"].as_str()?;

    let event = decode_change(table, kind, &data["record"], &data["old_record"]);
    if event.is_none() {
        tracing::debug!("Ignoring {} change on {}", kind, table);
    }
    event.map(|event| (channel, event))
}

fn decode_change(table: &str, kind: &str, record: &Value, old_record: &Value) -> Option<ChangeEvent> {
    match (table, kind) {
        (MESSAGES_TABLE, "INSERT") => serde_json::from_value(record.clone())
            .ok()
            .map(ChangeEvent::MessageInserted),
        (MESSAGES_TABLE, "UPDATE") => serde_json::from_value(record.clone())
            .ok()
            .map(ChangeEvent::MessageUpdated),
        (REACTIONS_TABLE, _) => record["message_id"]
            .as_str()
            .or_else(|| old_record["message_id"].as_str())
            .map(|id| ChangeEvent::ReactionsChanged {
                message_id: id.to_string(),
            }),
        (PRESENCE_TABLE, "INSERT" | "UPDATE") => serde_json::from_value(record.clone())
            .ok()
            .map(ChangeEvent::PresenceUpdated),
        (TYPING_TABLE, "INSERT" | "UPDATE") => serde_json::from_value(record.clone())
            .ok()
            .map(ChangeEvent::Typing),
        _ => None,
    }
}
