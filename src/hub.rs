//! WebSocket hub: authenticated long-lived connections with per-user and
//! per-event fan-out.
//!
//! Each connection starts unauthenticated, may bind a user via
//! `authenticate{token}`, and may subscribe to event ids. Two indices are
//! maintained over the connection table, `userId -> {conn}` and
//! `eventId -> {conn}`, so broadcasts select receivers without scanning.
//!
//! Sends are non-blocking and best-effort: every connection owns an
//! unbounded outbound queue drained by its writer task, and a send to a
//! connection that is gone is silently dropped. Dead peers are reaped by
//! the heartbeat: every sweep, connections that did not answer the
//! previous ping are terminated, the rest are pinged again. Detection
//! window is one to two sweep intervals.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::JwtVerifier;
use crate::record::ResultStatus;
use crate::shutdown::ShutdownSignal;

/// How often the liveness sweep runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connection identity inside the hub tables.
pub type ConnId = u64;

/// Frames accepted from clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    SubscribeEvent {
        #[serde(rename = "eventId")]
        event_id: i64,
    },
    UnsubscribeEvent {
        #[serde(rename = "eventId")]
        event_id: i64,
    },
    Ping,
}

/// Frames sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected,
    Authenticated {
        #[serde(rename = "userId")]
        user_id: i64,
        email: String,
    },
    AuthError {
        message: String,
    },
    Subscribed {
        #[serde(rename = "eventId")]
        event_id: i64,
    },
    Unsubscribed {
        #[serde(rename = "eventId")]
        event_id: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
    },
    ComputationResult {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "correlationId")]
        correlation_id: String,
        status: ResultStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

struct Connection {
    tx: UnboundedSender<Message>,
    user_id: Option<i64>,
    subscribed_events: HashSet<i64>,
    alive: bool,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnId, Connection>,
    by_user: HashMap<i64, HashSet<ConnId>>,
    by_event: HashMap<i64, HashSet<ConnId>>,
}

impl HubState {
    fn drop_from_indices(&mut self, conn_id: ConnId, conn: &Connection) {
        if let Some(user_id) = conn.user_id {
            if let Some(set) = self.by_user.get_mut(&user_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    self.by_user.remove(&user_id);
                }
            }
        }
        for event_id in &conn.subscribed_events {
            if let Some(set) = self.by_event.get_mut(event_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    self.by_event.remove(event_id);
                }
            }
        }
    }
}

/// The hub itself. Wrapped in `Arc` and shared between the HTTP layer
/// (socket upgrades), the result router (broadcast sink), and the
/// heartbeat task.
pub struct Hub {
    verifier: JwtVerifier,
    next_conn_id: AtomicU64,
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new(verifier: JwtVerifier) -> Self {
        Self {
            verifier,
            next_conn_id: AtomicU64::new(1),
            state: Mutex::new(HubState::default()),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().expect("hub state poisoned")
    }

    /// Register a connection with its outbound queue and greet it.
    pub fn register(&self, tx: UnboundedSender<Message>) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.lock().connections.insert(
            conn_id,
            Connection {
                tx,
                user_id: None,
                subscribed_events: HashSet::new(),
                alive: true,
            },
        );
        self.send_to(conn_id, &ServerMessage::Connected);
        debug!(conn_id, "WebSocket connection registered");
        conn_id
    }

    /// Remove a connection from the table and both indices, pruning
    /// index keys whose sets become empty.
    pub fn unregister(&self, conn_id: ConnId) {
        let mut state = self.lock();
        if let Some(conn) = state.connections.remove(&conn_id) {
            state.drop_from_indices(conn_id, &conn);
            debug!(conn_id, "WebSocket connection removed");
        }
    }

    /// Handle one inbound text frame.
    pub fn handle_message(&self, conn_id: ConnId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Authenticate { token }) => self.authenticate(conn_id, &token),
            Ok(ClientMessage::SubscribeEvent { event_id }) => self.subscribe(conn_id, event_id),
            Ok(ClientMessage::UnsubscribeEvent { event_id }) => {
                self.unsubscribe(conn_id, event_id)
            }
            Ok(ClientMessage::Ping) => self.send_to(
                conn_id,
                &ServerMessage::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                },
            ),
            Err(_) => self.send_to(
                conn_id,
                &ServerMessage::Error {
                    message: "Unknown message type".to_string(),
                },
            ),
        }
    }

    fn authenticate(&self, conn_id: ConnId, token: &str) {
        match self.verifier.verify(token) {
            Ok(identity) => {
                {
                    let mut guard = self.lock();
                    let state = &mut *guard;
                    if let Some(conn) = state.connections.get_mut(&conn_id) {
                        conn.user_id = Some(identity.user_id);
                    } else {
                        return;
                    }
                    state
                        .by_user
                        .entry(identity.user_id)
                        .or_default()
                        .insert(conn_id);
                }
                info!(conn_id, user_id = identity.user_id, "WebSocket authenticated");
                self.send_to(
                    conn_id,
                    &ServerMessage::Authenticated {
                        user_id: identity.user_id,
                        email: identity.email,
                    },
                );
            }
            Err(e) => {
                warn!(conn_id, error = %e, "WebSocket authentication failed");
                self.send_to(
                    conn_id,
                    &ServerMessage::AuthError {
                        message: "Authentication failed".to_string(),
                    },
                );
            }
        }
    }

    fn subscribe(&self, conn_id: ConnId, event_id: i64) {
        let authenticated = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.connections.get_mut(&conn_id) {
                Some(conn) if conn.user_id.is_some() => {
                    conn.subscribed_events.insert(event_id);
                    state.by_event.entry(event_id).or_default().insert(conn_id);
                    true
                }
                Some(_) => false,
                None => return,
            }
        };

        if authenticated {
            self.send_to(conn_id, &ServerMessage::Subscribed { event_id });
        } else {
            self.send_to(
                conn_id,
                &ServerMessage::Error {
                    message: "Authentication required".to_string(),
                },
            );
        }
    }

    fn unsubscribe(&self, conn_id: ConnId, event_id: i64) {
        {
            let mut state = self.lock();
            if let Some(conn) = state.connections.get_mut(&conn_id) {
                conn.subscribed_events.remove(&event_id);
            }
            if let Some(set) = state.by_event.get_mut(&event_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    state.by_event.remove(&event_id);
                }
            }
        }
        self.send_to(conn_id, &ServerMessage::Unsubscribed { event_id });
    }

    /// A pong (or any transport-level liveness proof) revives the peer.
    pub fn mark_alive(&self, conn_id: ConnId) {
        if let Some(conn) = self.lock().connections.get_mut(&conn_id) {
            conn.alive = true;
        }
    }

    fn send_to(&self, conn_id: ConnId, message: &ServerMessage) {
        let tx = {
            let state = self.lock();
            match state.connections.get(&conn_id) {
                Some(conn) => conn.tx.clone(),
                None => return,
            }
        };
        send_frame(&tx, message);
    }

    /// Deliver to every connection currently bound to `user_id`.
    pub fn broadcast_to_user(&self, user_id: i64, message: &ServerMessage) -> usize {
        let targets = {
            let state = self.lock();
            state
                .by_user
                .get(&user_id)
                .map(|set| {
                    set.iter()
                        .filter_map(|id| state.connections.get(id).map(|c| c.tx.clone()))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        for tx in &targets {
            send_frame(tx, message);
        }
        targets.len()
    }

    /// Deliver to every connection subscribed to `event_id`.
    pub fn broadcast_to_event(&self, event_id: i64, message: &ServerMessage) -> usize {
        let targets = {
            let state = self.lock();
            state
                .by_event
                .get(&event_id)
                .map(|set| {
                    set.iter()
                        .filter_map(|id| state.connections.get(id).map(|c| c.tx.clone()))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        for tx in &targets {
            send_frame(tx, message);
        }
        targets.len()
    }

    /// Deliver to every connection.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let targets = {
            let state = self.lock();
            state
                .connections
                .values()
                .map(|c| c.tx.clone())
                .collect::<Vec<_>>()
        };
        for tx in &targets {
            send_frame(tx, message);
        }
        targets.len()
    }

    /// One liveness pass: terminate peers that never answered the last
    /// ping, mark the rest dead and ping them. Returns (pinged, reaped).
    pub fn sweep_liveness(&self) -> (usize, usize) {
        let (to_ping, to_reap) = {
            let mut state = self.lock();
            let mut to_ping = Vec::new();
            let mut to_reap = Vec::new();
            for (&conn_id, conn) in state.connections.iter_mut() {
                if conn.alive {
                    conn.alive = false;
                    to_ping.push(conn.tx.clone());
                } else {
                    to_reap.push(conn_id);
                }
            }
            for conn_id in &to_reap {
                if let Some(conn) = state.connections.remove(conn_id) {
                    // Close frame nudges the peer; the writer task ends
                    // when the queue is dropped.
                    let _ = conn.tx.send(Message::Close(None));
                    state.drop_from_indices(*conn_id, &conn);
                }
            }
            (to_ping, to_reap)
        };

        for tx in &to_ping {
            let _ = tx.send(Message::Ping(Vec::new()));
        }
        if !to_reap.is_empty() {
            info!(reaped = to_reap.len(), "Terminated unresponsive WebSocket peers");
        }
        (to_ping.len(), to_reap.len())
    }

    /// Periodic liveness sweep, running until shutdown.
    pub fn spawn_heartbeat(self: &Arc<Self>, shutdown: &ShutdownSignal) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Hub heartbeat stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        hub.sweep_liveness();
                    }
                }
            }
        })
    }

    /// Drive one upgraded socket until it disconnects.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer: drain the outbound queue onto the socket.
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_tx.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let conn_id = self.register(tx);

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_message(conn_id, &text),
                Ok(Message::Pong(_)) => self.mark_alive(conn_id),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(conn_id, error = %e, "WebSocket read error");
                    break;
                }
            }
        }

        self.unregister(conn_id);
        writer.abort();
    }
}

fn send_frame(tx: &UnboundedSender<Message>, message: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(message) {
        // Best-effort: a closed queue means the peer is gone and the next
        // sweep (or the reader exit) cleans up the indices.
        let _ = tx.send(Message::Text(json));
    }
}
