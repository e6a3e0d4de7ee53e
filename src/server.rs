//! WebSocket collaboration gateway with per-session broadcast rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── Presence Store (TTL markers,
//!             ├── GatewayServer ──────┤    degrades to no-op)
//! Client B ──┘        │               └── Broadcast Fabric (pub/sub,
//!                     │                    degrades to local-only)
//!              ┌──────┴───────┐
//!              ▼              ▼
//!       ConnectionRegistry  RoomManager
//!       (subject ↔ conns)   (session:<id> / subject:<id> rooms)
//! ```
//!
//! Each connection runs one task through the state machine
//! `Connected(anonymous) → Authenticated → RoomMember(0..n) → Closed`.
//! The credential must arrive with the upgrade request; everything after
//! close is torn down deterministically — a closed connection appears in
//! zero rooms and zero registry entries.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{self, verify_credential};
use crate::directory::{Directory, Role, SubjectProfile};
use crate::fabric::{attach_fabric, FabricHandle, DEFAULT_FABRIC_CONNECT_TIMEOUT};
use crate::presence::{
    connect_presence, PresenceStore, DEFAULT_PRESENCE_OP_TIMEOUT, DEFAULT_PRESENCE_TTL_SECS,
};
use crate::protocol::{ClientEvent, PresenceStatus, ProtocolError, RoomName, ServerEvent};
use crate::registry::ConnectionRegistry;
use crate::rooms::{FrameSender, RoomManager};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared secret for credential verification
    pub jwt_secret: String,
    /// Backing store for presence markers and the broadcast fabric
    /// (None = no-op presence, local-only broadcast)
    pub redis_url: Option<String>,
    /// TTL for online presence markers
    pub presence_ttl_secs: u64,
    /// Deadline for each presence store operation
    pub presence_op_timeout: Duration,
    /// Deadline for each directory lookup
    pub lookup_timeout: Duration,
    /// Deadline for each fabric link at bootstrap
    pub fabric_connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            jwt_secret: "dev-secret".to_string(),
            redis_url: None,
            presence_ttl_secs: DEFAULT_PRESENCE_TTL_SECS,
            presence_op_timeout: DEFAULT_PRESENCE_OP_TIMEOUT,
            lookup_timeout: Duration::from_secs(2),
            fabric_connect_timeout: DEFAULT_FABRIC_CONNECT_TIMEOUT,
        }
    }
}

/// Gateway statistics.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub events_received: u64,
}

/// Gateway errors. Nothing here is allowed to take the process down; these
/// surface from `run` (bind failures) or terminate a single connection task.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Shared {
    config: GatewayConfig,
    registry: ConnectionRegistry,
    rooms: Arc<RoomManager>,
    directory: Arc<dyn Directory>,
    presence: Arc<dyn PresenceStore>,
    fabric: FabricHandle,
    stats: RwLock<GatewayStats>,
}

/// The collaboration gateway.
pub struct GatewayServer {
    shared: Arc<Shared>,
}

impl GatewayServer {
    /// Construct the gateway, attaching its best-effort dependencies.
    ///
    /// Presence store and broadcast fabric bootstrap run here, exactly once;
    /// either can degrade (no-op presence, local-only broadcast) without
    /// failing construction.
    pub async fn bootstrap(config: GatewayConfig, directory: Arc<dyn Directory>) -> Self {
        let rooms = Arc::new(RoomManager::new());
        let presence = connect_presence(
            config.redis_url.as_deref(),
            config.presence_ttl_secs,
            config.presence_op_timeout,
            config.fabric_connect_timeout,
        )
        .await;
        let fabric = attach_fabric(
            config.redis_url.as_deref(),
            config.fabric_connect_timeout,
            rooms.clone(),
        )
        .await;

        Self {
            shared: Arc::new(Shared {
                config,
                registry: ConnectionRegistry::new(),
                rooms,
                directory,
                presence,
                fabric,
                stats: RwLock::new(GatewayStats::default()),
            }),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop; call from an async runtime.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("gateway listening on {}", self.shared.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new tcp connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::warn!("connection task from {addr} ended with error: {e}");
                }
            });
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.shared.presence
    }

    /// Whether room broadcasts are mirrored across instances.
    pub fn fabric_attached(&self) -> bool {
        self.shared.fabric.is_remote()
    }

    pub async fn stats(&self) -> GatewayStats {
        self.shared.stats.read().await.clone()
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Handle one connection from transport accept to teardown.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), GatewayError> {
    // The credential rides on the upgrade request; capture it during the
    // handshake so the connection is never serviced anonymously.
    let mut credential: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        credential = auth::extract_bearer(
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok()),
            req.uri().query(),
        );
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut ws_sender, ws_receiver) = ws_stream.split();

    let Some(profile) = authenticate(&shared, addr, credential).await else {
        shared.stats.write().await.rejected_handshakes += 1;
        let _ = ws_sender.send(Message::Close(None)).await;
        return Ok(());
    };

    let conn_id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();

    let first = shared.registry.register(profile.id, conn_id).await;
    shared
        .rooms
        .join(RoomName::Subject(profile.id), conn_id, profile.id, out_tx.clone())
        .await;
    // Every connection refreshes the TTL marker; the peer fan-out fires
    // only on the offline→online edge.
    let presence = shared.presence.clone();
    let subject = profile.id;
    tokio::spawn(async move { presence.mark_online(subject).await });
    if first {
        notify_peers(&shared, &profile, PresenceStatus::Online).await;
    }
    {
        let mut stats = shared.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }
    log::info!(
        "subject {} ({}) connected from {addr} (conn {conn_id})",
        profile.name,
        profile.id
    );

    let loop_result =
        connection_loop(&shared, conn_id, &profile, &out_tx, ws_sender, ws_receiver, out_rx).await;

    // Teardown runs regardless of how the loop ended: the connection must
    // leave every room and the registry before this task returns.
    let left = shared.rooms.leave_all(conn_id).await;
    for room in left {
        if matches!(room, RoomName::Session(_)) {
            let event = ServerEvent::PeerLeft {
                subject_id: profile.id,
            };
            if let Err(e) = shared.rooms.deliver(&room, &event).await {
                log::warn!("peer-left delivery failed for {room}: {e}");
            }
            shared.fabric.publish(&room, &event).await;
        }
    }
    if let Some((subject, last)) = shared.registry.unregister(conn_id).await {
        if last {
            let presence = shared.presence.clone();
            tokio::spawn(async move { presence.mark_offline(subject).await });
            notify_peers(&shared, &profile, PresenceStatus::Offline).await;
        }
    }
    shared.stats.write().await.active_connections -= 1;
    log::info!("subject {} disconnected (conn {conn_id})", profile.id);

    loop_result
}

/// Verify the credential and resolve the subject's identity.
///
/// Any failure — missing/invalid credential, unknown subject, identity
/// lookup unavailable — rejects the handshake; none of them distinguish
/// themselves to the remote peer.
async fn authenticate(
    shared: &Shared,
    addr: SocketAddr,
    credential: Option<String>,
) -> Option<SubjectProfile> {
    let Some(token) = credential else {
        log::warn!("connection from {addr} carried no credential, closing");
        return None;
    };
    let subject_id = match verify_credential(&token, &shared.config.jwt_secret) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("credential verification failed for {addr}: {e}");
            return None;
        }
    };
    match timeout(
        shared.config.lookup_timeout,
        shared.directory.find_subject(subject_id),
    )
    .await
    {
        Ok(Ok(Some(profile))) => Some(profile),
        Ok(Ok(None)) => {
            log::warn!("credential for unknown subject {subject_id} from {addr}, closing");
            None
        }
        Ok(Err(e)) => {
            log::warn!("identity lookup failed for {subject_id}: {e}");
            None
        }
        Err(_) => {
            log::warn!("identity lookup timed out for {subject_id}");
            None
        }
    }
}

/// Per-connection event loop: inbound client frames and outbound room
/// deliveries, multiplexed on one task so each recipient observes a
/// sender's events in emission order.
async fn connection_loop(
    shared: &Arc<Shared>,
    conn_id: Uuid,
    profile: &SubjectProfile,
    out_tx: &FrameSender,
    mut ws_sender: WsSink,
    mut ws_receiver: WsSource,
    mut out_rx: mpsc::UnboundedReceiver<String>,
) -> Result<(), GatewayError> {
    let mut joined: HashSet<Uuid> = HashSet::new();

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        shared.stats.write().await.events_received += 1;
                        match ClientEvent::decode(text.as_str()) {
                            Ok(event) => {
                                handle_event(shared, conn_id, profile, out_tx, &mut joined, event)
                                    .await;
                            }
                            Err(e) => {
                                // Malformed payloads are dropped, not fatal.
                                log::warn!("malformed frame from conn {conn_id} dropped: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // The protocol is text frames only.
                        log::warn!(
                            "binary frame ({} bytes) from conn {conn_id} dropped",
                            data.len()
                        );
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("conn {conn_id} closed by peer");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        log::warn!("websocket error on conn {conn_id}: {e}");
                        return Ok(());
                    }
                    _ => {}
                }
            }

            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => ws_sender.send(Message::Text(frame.into())).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Dispatch one authenticated client event.
async fn handle_event(
    shared: &Arc<Shared>,
    conn_id: Uuid,
    profile: &SubjectProfile,
    out_tx: &FrameSender,
    joined: &mut HashSet<Uuid>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::JoinSession { session_id } => {
            join_session(shared, conn_id, profile, out_tx, joined, session_id).await;
        }

        ClientEvent::LeaveSession { session_id } => {
            if joined.remove(&session_id) {
                let room = RoomName::Session(session_id);
                shared.rooms.leave(&room, conn_id).await;
                let event = ServerEvent::PeerLeft {
                    subject_id: profile.id,
                };
                if let Err(e) = shared.rooms.deliver(&room, &event).await {
                    log::warn!("peer-left delivery failed for {room}: {e}");
                }
                shared.fabric.publish(&room, &event).await;
                log::debug!("conn {conn_id} left session {session_id}");
            }
        }

        // Point-to-point: delivered to the target's connections only, never
        // to the session room at large.
        ClientEvent::Signal {
            session_id,
            kind,
            payload,
            target_subject_id,
        } => {
            let event = ServerEvent::Signal {
                session_id,
                kind,
                payload,
                from_subject_id: profile.id,
                target_subject_id,
            };
            let room = RoomName::Subject(target_subject_id);
            if let Err(e) = shared.rooms.deliver(&room, &event).await {
                log::warn!("signal delivery failed for {room}: {e}");
            }
            shared.fabric.publish(&room, &event).await;
        }

        ClientEvent::Edit {
            session_id,
            changes,
        } => {
            let event = ServerEvent::Edit {
                session_id,
                changes,
                from_subject_id: profile.id,
            };
            relay(shared, conn_id, session_id, event).await;
        }

        ClientEvent::Cursor {
            session_id,
            position,
        } => {
            let event = ServerEvent::Cursor {
                session_id,
                position,
                from_subject_id: profile.id,
            };
            relay(shared, conn_id, session_id, event).await;
        }

        ClientEvent::Draw { session_id, stroke } => {
            let event = ServerEvent::Draw {
                session_id,
                stroke,
                from_subject_id: profile.id,
            };
            relay(shared, conn_id, session_id, event).await;
        }

        ClientEvent::ClearBoard { session_id } => {
            let event = ServerEvent::ClearBoard {
                session_id,
                from_subject_id: profile.id,
            };
            relay(shared, conn_id, session_id, event).await;
        }
    }
}

/// Room-broadcast relay: sender always excluded. A relay into a room the
/// connection is not a member of is a no-op and never reaches the fabric.
async fn relay(shared: &Arc<Shared>, conn_id: Uuid, session_id: Uuid, event: ServerEvent) {
    let room = RoomName::Session(session_id);
    match shared.rooms.broadcast_from(&room, conn_id, &event).await {
        Ok(Some(_)) => shared.fabric.publish(&room, &event).await,
        Ok(None) => {
            log::debug!("relay from non-member conn {conn_id} to {room} dropped");
        }
        Err(e) => log::warn!("relay encode failed for {room}: {e}"),
    }
}

/// Validate session membership and join the room.
///
/// Authorization is enforced: a subject absent from the participant list
/// gets an explicit error and does not join. Lookup failures deny too —
/// an unavailable dependency can degrade presence, not access control.
async fn join_session(
    shared: &Arc<Shared>,
    conn_id: Uuid,
    profile: &SubjectProfile,
    out_tx: &FrameSender,
    joined: &mut HashSet<Uuid>,
    session_id: Uuid,
) {
    let participants = match timeout(
        shared.config.lookup_timeout,
        shared.directory.session_participants(session_id),
    )
    .await
    {
        Ok(Ok(Some(participants))) => participants,
        Ok(Ok(None)) => {
            send_event(out_tx, &ServerEvent::error("session not found"));
            return;
        }
        Ok(Err(e)) => {
            log::warn!("participant lookup failed for session {session_id}: {e}");
            send_event(out_tx, &ServerEvent::error("session lookup unavailable"));
            return;
        }
        Err(_) => {
            log::warn!("participant lookup timed out for session {session_id}");
            send_event(out_tx, &ServerEvent::error("session lookup unavailable"));
            return;
        }
    };

    if !participants.contains(&profile.id) {
        log::warn!(
            "subject {} denied join to session {session_id}: not a participant",
            profile.id
        );
        send_event(out_tx, &ServerEvent::error("not a session participant"));
        return;
    }

    let room = RoomName::Session(session_id);
    shared
        .rooms
        .join(room, conn_id, profile.id, out_tx.clone())
        .await;
    joined.insert(session_id);

    let event = ServerEvent::PeerJoined {
        subject_id: profile.id,
        name: profile.name.clone(),
    };
    match shared.rooms.broadcast_from(&room, conn_id, &event).await {
        Ok(Some(_)) => shared.fabric.publish(&room, &event).await,
        Ok(None) => {}
        Err(e) => log::warn!("peer-joined broadcast failed for {room}: {e}"),
    }

    send_event(out_tx, &ServerEvent::Joined { session_id });
    log::info!(
        "subject {} joined session {session_id} (conn {conn_id}, {} members)",
        profile.id,
        shared.rooms.member_count(&room).await
    );
}

/// Fan a presence transition out to the subject's peer set.
///
/// The peer set comes from the social graph; lookup failure skips the
/// notification with a log line rather than affecting the connection.
async fn notify_peers(shared: &Arc<Shared>, profile: &SubjectProfile, status: PresenceStatus) {
    if profile.role != Role::Candidate {
        return;
    }
    let peers = match timeout(
        shared.config.lookup_timeout,
        shared.directory.peers_of(profile.id),
    )
    .await
    {
        Ok(Ok(peers)) => peers,
        Ok(Err(e)) => {
            log::warn!("peer lookup failed for {}: {e}", profile.id);
            return;
        }
        Err(_) => {
            log::warn!("peer lookup timed out for {}", profile.id);
            return;
        }
    };

    let event = ServerEvent::Presence {
        subject_id: profile.id,
        status,
    };
    for peer in peers {
        let room = RoomName::Subject(peer);
        if let Err(e) = shared.rooms.deliver(&room, &event).await {
            log::warn!("presence delivery failed for {room}: {e}");
        }
        shared.fabric.publish(&room, &event).await;
    }
}

fn send_event(out_tx: &FrameSender, event: &ServerEvent) {
    match event.encode() {
        Ok(frame) => {
            // Receiver dropped means the connection is already tearing down.
            let _ = out_tx.send(frame);
        }
        Err(e) => log::error!("server event encode failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;

    #[test]
    fn test_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert!(config.redis_url.is_none());
        assert_eq!(config.presence_ttl_secs, 300);
        assert_eq!(config.fabric_connect_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_bootstrap_without_backing_store() {
        let directory = Arc::new(InMemoryDirectory::new());
        let server = GatewayServer::bootstrap(GatewayConfig::default(), directory).await;
        assert!(!server.fabric_attached());
        assert!(!server.presence().is_online(Uuid::new_v4()).await);
        assert_eq!(server.bind_addr(), "127.0.0.1:9100");
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let directory = Arc::new(InMemoryDirectory::new());
        let server = GatewayServer::bootstrap(GatewayConfig::default(), directory).await;
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.rejected_handshakes, 0);
        assert_eq!(stats.events_received, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_with_unreachable_store_degrades() {
        let config = GatewayConfig {
            redis_url: Some("redis://127.0.0.1:1/".to_string()),
            fabric_connect_timeout: Duration::from_millis(300),
            ..GatewayConfig::default()
        };
        let directory = Arc::new(InMemoryDirectory::new());
        let server = GatewayServer::bootstrap(config, directory).await;
        assert!(!server.fabric_attached());
        assert!(!server.presence().is_online(Uuid::new_v4()).await);
    }
}
