//! Registry of live progress connections, keyed by user.
//!
//! Structural changes (register, unregister, shutdown) are applied by a
//! single control task that owns every write to the registry, so they are
//! totally ordered. Delivery (`send_to_user`, `broadcast`) only takes the
//! read side of the lock and never waits on a client or on the control
//! task: a full or closed outbound queue gets its connection queued for
//! removal instead.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use bulkedit_core::job_events::{MSG_TYPE_CONNECTED, MSG_TYPE_SHUTDOWN};
use bulkedit_core::types::{DbId, Timestamp};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::ws::heartbeat::Liveness;

/// Pending control requests before `register`/`unregister` callers wait.
const CONTROL_CAPACITY: usize = 256;

struct Connection {
    username: String,
    sender: mpsc::Sender<Message>,
    connected_at: Timestamp,
    liveness: Arc<Liveness>,
}

type Registry = HashMap<DbId, HashMap<String, Connection>>;

enum Control {
    Register {
        user_id: DbId,
        username: String,
        reply: oneshot::Sender<ConnectionHandle>,
    },
    /// `reply` is `None` for removals queued from the delivery path.
    Unregister {
        user_id: DbId,
        conn_id: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// What a newly registered connection needs to run its reader and writer.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub user_id: DbId,
    /// Outbound queue; the "connected" acknowledgment is already in it.
    pub receiver: mpsc::Receiver<Message>,
    pub liveness: Arc<Liveness>,
}

/// Read-only view of one registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub conn_id: String,
    pub user_id: DbId,
    pub username: String,
    pub connected_at: Timestamp,
    pub last_heartbeat: Timestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Progress hub is shut down")]
    Closed,
}

/// Build a generic `{type, data, timestamp}` text frame.
pub fn notice(kind: &str, data: serde_json::Value) -> Message {
    let payload = serde_json::json!({
        "type": kind,
        "data": data,
        "timestamp": chrono::Utc::now(),
    });
    Message::Text(payload.to_string().into())
}

pub struct ProgressHub {
    registry: Arc<RwLock<Registry>>,
    control: mpsc::Sender<Control>,
}

impl ProgressHub {
    /// Create a hub and spawn its control task.
    ///
    /// `queue_capacity` bounds each connection's outbound queue.
    pub fn start(queue_capacity: usize) -> Arc<Self> {
        let registry: Arc<RwLock<Registry>> = Arc::default();
        let (control, rx) = mpsc::channel(CONTROL_CAPACITY);

        tokio::spawn(run_control(Arc::clone(&registry), rx, queue_capacity.max(1)));

        Arc::new(Self { registry, control })
    }

    /// Register a connection for `user_id`.
    pub async fn register(&self, user_id: DbId, username: &str) -> Result<ConnectionHandle, HubError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Register {
                user_id,
                username: username.to_string(),
                reply,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a connection and close its outbound queue.
    ///
    /// Returns `false` if it was already gone.
    pub async fn unregister(&self, user_id: DbId, conn_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let request = Control::Unregister {
            user_id,
            conn_id: conn_id.to_string(),
            reply: Some(reply),
        };
        if self.control.send(request).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Queue `message` on every connection of `user_id`.
    ///
    /// Returns the number of connections it was queued on.
    pub async fn send_to_user(&self, user_id: DbId, message: Message) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let registry = self.registry.read().await;
            let Some(conns) = registry.get(&user_id) else {
                return 0;
            };
            for (conn_id, conn) in conns {
                if offer(user_id, conn_id, conn, &message) {
                    delivered += 1;
                } else {
                    dropped.push((user_id, conn_id.clone()));
                }
            }
        }
        self.drop_connections(dropped);
        delivered
    }

    /// Queue `message` on every registered connection.
    pub async fn broadcast(&self, message: Message) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let registry = self.registry.read().await;
            for (&user_id, conns) in registry.iter() {
                for (conn_id, conn) in conns {
                    if offer(user_id, conn_id, conn, &message) {
                        delivered += 1;
                    } else {
                        dropped.push((user_id, conn_id.clone()));
                    }
                }
            }
        }
        self.drop_connections(dropped);
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.values().map(HashMap::len).sum()
    }

    pub async fn user_connection_count(&self, user_id: DbId) -> usize {
        self.registry
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let registry = self.registry.read().await;
        registry
            .iter()
            .flat_map(|(&user_id, conns)| {
                conns.iter().map(move |(conn_id, conn)| ConnectionInfo {
                    conn_id: conn_id.clone(),
                    user_id,
                    username: conn.username.clone(),
                    connected_at: conn.connected_at,
                    last_heartbeat: conn.liveness.last_seen(),
                })
            })
            .collect()
    }

    /// Send a Close frame to every connection, clear the registry and
    /// refuse further registrations.
    pub async fn shutdown_all(&self) {
        let (reply, rx) = oneshot::channel();
        if self.control.send(Control::Shutdown { reply }).await.is_err() {
            return;
        }
        let count = rx.await.unwrap_or(0);
        tracing::info!(count, "Closed all WebSocket connections");
    }

    /// Queue removals without waiting for the control task.
    ///
    /// A removal lost to a full control queue is requested again by the
    /// next send that finds the same connection unusable.
    fn drop_connections(&self, dropped: Vec<(DbId, String)>) {
        for (user_id, conn_id) in dropped {
            let request = Control::Unregister {
                user_id,
                conn_id,
                reply: None,
            };
            if let Err(e) = self.control.try_send(request) {
                tracing::debug!(error = %e, "Connection removal not queued");
            }
        }
    }
}

/// Non-blocking enqueue; `false` means the connection must be dropped.
fn offer(user_id: DbId, conn_id: &str, conn: &Connection, message: &Message) -> bool {
    match conn.sender.try_send(message.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(user_id, conn_id, "Outbound queue full, dropping slow connection");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(user_id, conn_id, "Outbound queue closed, dropping connection");
            false
        }
    }
}

/// The only task that mutates the registry.
async fn run_control(
    registry: Arc<RwLock<Registry>>,
    mut rx: mpsc::Receiver<Control>,
    queue_capacity: usize,
) {
    let mut closed = false;

    while let Some(request) = rx.recv().await {
        match request {
            Control::Register {
                user_id,
                username,
                reply,
            } => {
                if closed {
                    // Dropping `reply` reports `HubError::Closed`.
                    continue;
                }

                let conn_id = uuid::Uuid::new_v4().to_string();
                let now = chrono::Utc::now();
                let liveness = Arc::new(Liveness::new(now));
                let (sender, receiver) = mpsc::channel(queue_capacity);

                let ack = notice(
                    MSG_TYPE_CONNECTED,
                    serde_json::json!({
                        "conn_id": conn_id,
                        "user_id": user_id,
                        "username": username,
                    }),
                );
                // Fresh queue with capacity >= 1: cannot be full.
                let _ = sender.try_send(ack);

                registry.write().await.entry(user_id).or_default().insert(
                    conn_id.clone(),
                    Connection {
                        username,
                        sender,
                        connected_at: now,
                        liveness: Arc::clone(&liveness),
                    },
                );
                tracing::info!(user_id, conn_id = %conn_id, "Progress connection registered");

                let handle = ConnectionHandle {
                    conn_id,
                    user_id,
                    receiver,
                    liveness,
                };
                // If the caller went away the receiver is dropped with the
                // handle and the next send removes the entry.
                let _ = reply.send(handle);
            }

            Control::Unregister {
                user_id,
                conn_id,
                reply,
            } => {
                let removed = {
                    let mut registry = registry.write().await;
                    let removed = registry
                        .get_mut(&user_id)
                        .and_then(|conns| conns.remove(&conn_id))
                        .is_some();
                    if registry.get(&user_id).is_some_and(HashMap::is_empty) {
                        registry.remove(&user_id);
                    }
                    removed
                };
                if removed {
                    tracing::info!(user_id, conn_id = %conn_id, "Progress connection removed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }

            Control::Shutdown { reply } => {
                closed = true;
                let mut registry = registry.write().await;
                let farewell = notice(MSG_TYPE_SHUTDOWN, serde_json::json!({}));
                let mut count = 0;
                for conn in registry.values().flat_map(HashMap::values) {
                    let _ = conn.sender.try_send(farewell.clone());
                    let _ = conn.sender.try_send(Message::Close(None));
                    count += 1;
                }
                registry.clear();
                let _ = reply.send(count);
            }
        }
    }
}
