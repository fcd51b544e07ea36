use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{PatchBatch, PatchError};
use crate::models::{DiffMessage, InitMessage, ServerMessage};
use crate::resolver::{DocResolver, ResolverError};

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close { code: u16, reason: String },
}

/// Terminal reason delivered over a connection's completion channel.
///
/// The channel is single-slot; whichever of the coordinator's duties (or the
/// registry's host-disconnect cascade) signals first wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection cleanly.
    PeerClosed,
    /// The session host left; the session is over for everyone.
    HostDisconnected,
    /// Structurally invalid traffic from the peer.
    Malformed(String),
    /// Read-inactivity deadline passed with no pong.
    TimedOut,
    /// Socket-level failure; the peer is presumed gone.
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the connection"),
            CloseReason::HostDisconnected => write!(f, "session host disconnected"),
            CloseReason::Malformed(msg) => write!(f, "malformed message: {msg}"),
            CloseReason::TimedOut => write!(f, "read inactivity deadline exceeded"),
            CloseReason::Transport(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

/// A session member as the registry sees it.
#[derive(Debug, Clone)]
pub struct SessionConn {
    pub id: Uuid,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub completion: mpsc::Sender<CloseReason>,
}

/// Everything a joining connection brings besides its channels. The username
/// is resolved by the upstream auth layer and trusted as-is.
#[derive(Debug, Clone)]
pub struct JoinContext {
    pub username: String,
    pub note_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Removed; other members remain.
    Detached,
    /// Removed; the session was torn down and its note flushed.
    SessionClosed,
    /// The connection was not a member (repeat disconnect).
    AlreadyAbsent,
}

#[derive(Debug)]
pub enum RegistryError {
    UnknownSession,
    MissingDocumentIdentifier,
    InitializationFailed(ResolverError),
    PatchRejected(PatchError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownSession => write!(f, "session does not exist"),
            RegistryError::MissingDocumentIdentifier => {
                write!(f, "expected note name from session initiator via `note_name`")
            }
            RegistryError::InitializationFailed(e) => {
                write!(f, "failed to initialize session resolver: {e}")
            }
            RegistryError::PatchRejected(e) => write!(f, "patch batch rejected: {e}"),
        }
    }
}

impl Error for RegistryError {}

struct Session {
    host_id: Uuid,
    members: Vec<SessionConn>,
    resolver: DocResolver,
}

/// The single source of truth for who is editing what.
///
/// Constructed once at startup and handed to the connection layer through the
/// app state; every mutation of the session map and of member lists happens
/// under the one registry-wide lock. The registry lock is always taken before
/// a resolver lock, never the other way around, and broadcasts are
/// non-blocking queue sends, so holding the registry lock across them cannot
/// stall on a slow peer.
pub struct SessionRegistry {
    note_dir: PathBuf,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl SessionRegistry {
    pub fn new(note_dir: PathBuf) -> Self {
        Self {
            note_dir,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection with a session, creating the session (and
    /// loading its note) if this is the first connection to `sid`.
    ///
    /// The bootstrap message is queued on the connection's outbound channel
    /// before the registry lock is released, so it always reaches the client
    /// ahead of any concurrently broadcast diff. The snapshot is also
    /// returned to the caller. If resolver initialization fails, nothing is
    /// registered.
    pub async fn connect(
        &self,
        sid: Uuid,
        conn: SessionConn,
        ctx: JoinContext,
    ) -> Result<(String, u64), RegistryError> {
        let mut sessions = self.sessions.lock().await;

        if !sessions.contains_key(&sid) {
            // Session initiator must provide the note name.
            let note_name = ctx
                .note_name
                .as_deref()
                .ok_or(RegistryError::MissingDocumentIdentifier)?;
            let path = self
                .note_dir
                .join(&ctx.username)
                .join(format!("{note_name}.md"));

            let resolver = DocResolver::new(path);
            resolver
                .initialize()
                .await
                .map_err(RegistryError::InitializationFailed)?;

            info!(
                "session {sid} created by {} for note {note_name:?}",
                ctx.username
            );
            sessions.insert(
                sid,
                Session {
                    host_id: conn.id,
                    members: Vec::with_capacity(2),
                    resolver,
                },
            );
        }

        let session = sessions.get_mut(&sid).expect("session just ensured");
        debug_assert!(
            session.members.iter().all(|m| m.id != conn.id),
            "connection joined the same session twice"
        );

        let (text, version) = session.resolver.snapshot().await;
        let init = ServerMessage::Init(InitMessage {
            text: text.clone(),
            version,
        });
        if conn.outbound.send(Outbound::Message(init)).is_err() {
            // Cannot happen while the coordinator is awaiting this call; it
            // still holds the receiving end.
            warn!("connection {} vanished before bootstrap", conn.id);
        }
        session.members.push(conn);

        Ok((text, version))
    }

    /// Apply a patch batch on behalf of `origin` and fan the resulting diff
    /// out to every other member of the session.
    ///
    /// Members whose outbound queue is gone are presumed dead and run through
    /// the regular disconnect path once delivery to the rest has finished;
    /// the write itself still succeeds.
    pub async fn write(
        &self,
        sid: Uuid,
        origin: Uuid,
        patches: PatchBatch,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;

        let dead: Vec<Uuid> = {
            let session = sessions.get_mut(&sid).ok_or(RegistryError::UnknownSession)?;

            let diffs = session
                .resolver
                .apply_and_diff(&patches)
                .await
                .map_err(RegistryError::PatchRejected)?;

            let msg = ServerMessage::Diff(DiffMessage { diffs });
            let mut dead = Vec::new();
            for member in &session.members {
                if member.id == origin {
                    continue;
                }
                if member.outbound.send(Outbound::Message(msg.clone())).is_err() {
                    dead.push(member.id);
                }
            }
            dead
        };

        for conn_id in dead {
            warn!("dropping unreachable connection {conn_id} from session {sid}");
            if let Err(e) = Self::detach(&mut sessions, sid, conn_id).await {
                debug!("unreachable connection {conn_id} already detached: {e}");
            }
        }

        Ok(())
    }

    /// Remove a connection from a session.
    ///
    /// Idempotent: disconnecting an absent connection reports
    /// [`DisconnectOutcome::AlreadyAbsent`] (or [`RegistryError::UnknownSession`]
    /// once the whole session is gone) and has no further side effects.
    pub async fn disconnect(
        &self,
        sid: Uuid,
        conn_id: Uuid,
    ) -> Result<DisconnectOutcome, RegistryError> {
        let mut sessions = self.sessions.lock().await;
        Self::detach(&mut sessions, sid, conn_id).await
    }

    /// Session and connection counts, for diagnostics.
    pub async fn stats(&self) -> (u32, u32) {
        let sessions = self.sessions.lock().await;
        let n_conns = sessions.values().map(|s| s.members.len() as u32).sum();
        (sessions.len() as u32, n_conns)
    }

    /// Flush and drop every remaining session. Run once, at process exit.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (sid, session) in sessions.drain() {
            info!("flushing session {sid} on shutdown");
            for member in &session.members {
                let _ = member.completion.try_send(CloseReason::HostDisconnected);
            }
            if let Err(e) = session.resolver.flush().await {
                error!("failed to persist note for session {sid}: {e}");
            }
        }
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Shared removal path for explicit disconnects and dead broadcast
    /// targets. Caller holds the registry lock.
    ///
    /// Host departure evicts everyone else with a single close signal each
    /// and tears the session down; the last member leaving tears it down
    /// quietly. Either way the resolver is flushed exactly once, and the
    /// in-memory side is released even if that flush fails.
    async fn detach(
        sessions: &mut HashMap<Uuid, Session>,
        sid: Uuid,
        conn_id: Uuid,
    ) -> Result<DisconnectOutcome, RegistryError> {
        let session = sessions.get_mut(&sid).ok_or(RegistryError::UnknownSession)?;

        let Some(pos) = session.members.iter().position(|m| m.id == conn_id) else {
            debug!("connection {conn_id} already absent from session {sid}");
            return Ok(DisconnectOutcome::AlreadyAbsent);
        };
        session.members.remove(pos);

        let host_left = conn_id == session.host_id;
        if !host_left && !session.members.is_empty() {
            return Ok(DisconnectOutcome::Detached);
        }

        let session = sessions.remove(&sid).expect("session present");
        if host_left {
            // Kick the remaining members; each coordinator turns this into a
            // policy-violation close frame on its own socket.
            info!(
                "host left session {sid}, evicting {} remaining member(s)",
                session.members.len()
            );
            for member in &session.members {
                if member
                    .completion
                    .try_send(CloseReason::HostDisconnected)
                    .is_err()
                {
                    debug!("member {} is already tearing down", member.id);
                }
            }
        } else {
            info!("last member left session {sid}");
        }

        if let Err(e) = session.resolver.flush().await {
            error!("failed to persist note for session {sid}: {e}");
        }

        Ok(DisconnectOutcome::SessionClosed)
    }
}
