use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    Extension,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{ClientMessage, RejectMessage, ServerMessage};
use crate::registry::{CloseReason, JoinContext, Outbound, RegistryError, SessionConn};
use crate::routes::auth_middleware::AuthUser;
use crate::AppState;

/// How long the writer gets to deliver the final close frame.
const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
pub struct WsQuery {
    pub sid: Option<String>,
    pub note_name: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    info!("websocket connection attempt by {}", user.username);
    ws.on_upgrade(move |socket| handle_socket(socket, params, user, state))
}

/// Per-connection control loop.
///
/// Three concurrent duties share the socket: a read pump (spawned), a writer
/// draining the ordered outbound queue (spawned), and this function's own
/// select loop over the completion signal and the keepalive timer. The first
/// terminal signal wins and drives an unconditional teardown: deregister,
/// stop the timer, close the socket.
async fn handle_socket(socket: WebSocket, params: WsQuery, user: AuthUser, state: Arc<AppState>) {
    let sid = match params.sid.as_deref().map(Uuid::parse_str) {
        Some(Ok(sid)) => sid,
        Some(Err(e)) => {
            warn!("rejecting connection with malformed session id: {e}");
            reject(socket, "expected a UUID session id via `sid`").await;
            return;
        }
        None => {
            warn!("rejecting connection without a session id");
            reject(socket, "expected a session id via `sid`").await;
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (done_tx, mut done_rx) = mpsc::channel::<CloseReason>(1);

    let conn = SessionConn {
        id: conn_id,
        outbound: out_tx.clone(),
        completion: done_tx.clone(),
    };
    let ctx = JoinContext {
        username: user.username.clone(),
        note_name: params.note_name,
    };

    // The registry queues the bootstrap message while it still holds its
    // lock, so the full document reaches the client ahead of any diff and a
    // late joiner renders current state rather than replaying a stream.
    let (_, version) = match state.registry.connect(sid, conn, ctx).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("join refused for session {sid}: {e}");
            reject(socket, &e.to_string()).await;
            return;
        }
    };
    info!(
        "connection {conn_id} joined session {sid} as {} at version {version}",
        user.username
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(out_rx, sink, done_tx.clone()));

    let read_timeout = state.config.ws_read_timeout();
    let pump = tokio::spawn(read_pump(
        stream,
        sid,
        conn_id,
        state.clone(),
        out_tx.clone(),
        done_tx.clone(),
        read_timeout,
    ));

    let mut keepalive = tokio::time::interval(state.config.ws_ping_interval());
    keepalive.tick().await; // the first tick completes immediately

    let reason = loop {
        tokio::select! {
            signal = done_rx.recv() => {
                // Our own sender is alive, so recv cannot return None.
                break signal.unwrap_or(CloseReason::PeerClosed);
            }
            _ = keepalive.tick() => {
                if out_tx.send(Outbound::Ping).is_err() {
                    break CloseReason::Transport("keepalive probe failed".to_string());
                }
            }
        }
    };

    // Teardown. All three steps run on every exit path: the registry entry
    // is released, the keepalive stops with this loop, the socket closes.
    info!("connection {conn_id} on session {sid} closing: {reason}");
    match state.registry.disconnect(sid, conn_id).await {
        Ok(outcome) => debug!("connection {conn_id} deregistered: {outcome:?}"),
        Err(e) => debug!("connection {conn_id} already deregistered: {e}"),
    }

    if let Some((code, detail)) = close_frame_for(&reason) {
        let _ = out_tx.send(Outbound::Close {
            code,
            reason: detail,
        });
    }
    drop(out_tx);
    pump.abort();
    if tokio::time::timeout(CLOSE_DEADLINE, writer).await.is_err() {
        warn!("connection {conn_id} writer did not drain in time");
    }
}

/// Close frame matching a terminal reason, if the peer can still hear one.
fn close_frame_for(reason: &CloseReason) -> Option<(u16, String)> {
    match reason {
        CloseReason::PeerClosed => Some((close_code::NORMAL, String::new())),
        CloseReason::HostDisconnected => {
            Some((close_code::POLICY, "session host disconnected".to_string()))
        }
        CloseReason::Malformed(msg) => Some((close_code::UNSUPPORTED, msg.clone())),
        CloseReason::TimedOut => Some((
            close_code::AWAY,
            "read inactivity deadline exceeded".to_string(),
        )),
        CloseReason::Transport(_) => None,
    }
}

/// Close an unregistered socket with an unsupported-data frame.
async fn reject(mut socket: WebSocket, reason: &str) {
    let frame = CloseFrame {
        code: close_code::UNSUPPORTED,
        reason: reason.to_string().into(),
    };
    if socket.send(Message::Close(Some(frame))).await.is_err() {
        debug!("peer vanished before the close frame was sent");
    }
}

/// Drain the ordered outbound queue into the socket.
///
/// Ordering is the queue's FIFO order, which the registry fills under its
/// lock, so each peer sees diffs in the order the resolver accepted them. A
/// sink failure marks the peer dead and signals completion.
async fn write_pump(
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    mut sink: SplitSink<WebSocket, Message>,
    done: mpsc::Sender<CloseReason>,
) {
    while let Some(frame) = out_rx.recv().await {
        let msg = match frame {
            Outbound::Message(payload) => match serde_json::to_string(&payload) {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    error!("failed to encode outbound message: {e}");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };
        if let Err(e) = sink.send(msg).await {
            let _ = done.try_send(CloseReason::Transport(e.to_string()));
            break;
        }
    }
}

/// Inbound message pump.
///
/// Suspends on the next frame under the read-inactivity deadline; pongs push
/// the deadline out. Edit messages go to the registry; a rejected batch is
/// reported back to this connection only. Anything structurally invalid ends
/// the connection.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    sid: Uuid,
    conn_id: Uuid,
    state: Arc<AppState>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    done: mpsc::Sender<CloseReason>,
    read_timeout: Duration,
) {
    let mut deadline = Instant::now() + read_timeout;

    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                let _ = done.try_send(CloseReason::TimedOut);
                return;
            }
            Ok(None) => {
                let _ = done.try_send(CloseReason::Transport(
                    "connection dropped without close".to_string(),
                ));
                return;
            }
            Ok(Some(Err(e))) => {
                let _ = done.try_send(CloseReason::Transport(e.to_string()));
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Pong(_) => {
                deadline = Instant::now() + read_timeout;
            }
            Message::Ping(_) => {
                // axum answers pings on our behalf
            }
            Message::Close(_) => {
                let _ = done.try_send(CloseReason::PeerClosed);
                return;
            }
            Message::Binary(_) => {
                let _ = done.try_send(CloseReason::Malformed(
                    "binary frames are not part of the protocol".to_string(),
                ));
                return;
            }
            Message::Text(raw) => {
                let parsed: ClientMessage = match serde_json::from_str(&raw) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("malformed message on connection {conn_id}: {e}");
                        let _ = done.try_send(CloseReason::Malformed(e.to_string()));
                        return;
                    }
                };

                let ClientMessage::Edit(edit) = parsed;
                match state.registry.write(sid, conn_id, edit.patches).await {
                    Ok(()) => {}
                    Err(RegistryError::PatchRejected(e)) => {
                        // Recoverable, and visible only to the writer.
                        debug!("patch batch from {conn_id} rejected: {e}");
                        let reject = ServerMessage::Reject(RejectMessage {
                            reason: e.to_string(),
                        });
                        if out_tx.send(Outbound::Message(reject)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // The session vanished under us (host-leave race).
                        debug!("write on dead session {sid}: {e}");
                        let _ = done.try_send(CloseReason::Transport(e.to_string()));
                        return;
                    }
                }
            }
        }
    }
}
