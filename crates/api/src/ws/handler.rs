use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use bulkedit_core::error::CoreError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::state::AppState;
use crate::ws::heartbeat::{HeartbeatConfig, Liveness};
use crate::ws::hub::ProgressHub;

/// Query string of the upgrade request (`/ws?token=...`); browsers cannot
/// set headers on WebSocket handshakes.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /api/v1/ws -- authenticate, then upgrade to a progress connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
) -> AppResult<impl IntoResponse> {
    let token = query.token.ok_or_else(|| {
        AppError::Core(CoreError::Unauthorized("Missing token query parameter".into()))
    })?;
    let user = AuthUser::from_token(&token, &state.config.jwt)?;
    let hub = Arc::clone(&state.hub);
    let heartbeat = state.config.heartbeat;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, user, heartbeat)))
}

/// Run one connection after upgrade.
///
/// The socket is split into two halves that never share the transport:
/// the writer drains the hub queue and sends heartbeats, the reader only
/// tracks liveness and close frames. Whichever finishes first ends the
/// connection.
async fn handle_socket(socket: WebSocket, hub: Arc<ProgressHub>, user: AuthUser, heartbeat: HeartbeatConfig) {
    let handle = match hub.register(user.user_id, &user.username).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::debug!(user_id = user.user_id, error = %e, "Rejecting WebSocket connection");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let conn_id = handle.conn_id.clone();
    tracing::info!(conn_id = %conn_id, user_id = user.user_id, "WebSocket connected");

    let (sink, stream) = socket.split();

    let mut send_task = tokio::spawn(write_loop(
        sink,
        handle.receiver,
        Arc::clone(&handle.liveness),
        heartbeat,
        conn_id.clone(),
    ));
    let mut recv_task = tokio::spawn(read_loop(stream, handle.liveness, conn_id.clone()));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(user.user_id, &conn_id).await;
    tracing::info!(conn_id = %conn_id, user_id = user.user_id, "WebSocket disconnected");
}

/// Outbound half: forward queued messages and emit heartbeats.
///
/// Ends when the hub closes the queue, the sink fails, or the peer has
/// been silent longer than the heartbeat timeout.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    liveness: Arc<Liveness>,
    heartbeat: HeartbeatConfig,
    conn_id: String,
) {
    let mut ticker = tokio::time::interval(heartbeat.interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if sink.send(msg).await.is_err() {
                        tracing::debug!(conn_id = %conn_id, "WebSocket sink closed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => {
                    // Unregistered or dropped as a slow consumer.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if liveness.is_stale(chrono::Utc::now(), heartbeat.timeout) {
                    tracing::info!(conn_id = %conn_id, "WebSocket peer silent past timeout, closing");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Inbound half: liveness and close handling only.
async fn read_loop(mut stream: SplitStream<WebSocket>, liveness: Arc<Liveness>, conn_id: String) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => liveness.touch(),
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}
