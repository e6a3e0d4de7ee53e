//! # collab-gateway — Real-time collaboration gateway
//!
//! Accepts authenticated WebSocket connections, organizes them into
//! per-session broadcast rooms, and relays signaling and editing events
//! with sender-exclusion semantics. Presence and cross-instance broadcast
//! are best-effort: both degrade safely when their backing store is away.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   WebSocket (JSON)   ┌────────────────┐
//! │ GatewayClient │ ◄──────────────────► │  GatewayServer │
//! │  (per user)   │                      │                │
//! └───────────────┘                      └───────┬────────┘
//!                                                │
//!                    ┌───────────────┬───────────┼──────────────┐
//!                    ▼               ▼           ▼              ▼
//!            ConnectionRegistry  RoomManager  PresenceStore  Fabric
//!            (subject ↔ conns)   (fan-out)    (TTL markers)  (pub/sub,
//!                                                             optional)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (tagged client/server event enums)
//! - [`auth`] — bearer credential verification (HS256 JWT)
//! - [`registry`] — subject ↔ connection bookkeeping, presence transitions
//! - [`rooms`] — room membership and ordered fan-out
//! - [`presence`] — advisory TTL presence markers, no-op fallback
//! - [`fabric`] — cross-instance broadcast bootstrap, local fallback
//! - [`directory`] — read-only platform lookups (identity, participants,
//!   peer graph)
//! - [`server`] — the gateway: handshake, room routing, relay, teardown
//! - [`client`] — typed client used by tests and embedding hosts

pub mod auth;
pub mod client;
pub mod directory;
pub mod fabric;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod server;

// Re-exports for convenience
pub use auth::{extract_bearer, mint_credential, verify_credential, AuthError, Claims};
pub use client::GatewayClient;
pub use directory::{Directory, DirectoryError, InMemoryDirectory, Role, SubjectProfile};
pub use fabric::{attach_fabric, FabricHandle, DEFAULT_FABRIC_CONNECT_TIMEOUT};
pub use presence::{
    connect_presence, NoopPresence, PresenceStore, RedisPresence, DEFAULT_PRESENCE_OP_TIMEOUT,
    DEFAULT_PRESENCE_TTL_SECS,
};
pub use protocol::{
    ClientEvent, PresenceStatus, ProtocolError, RoomName, ServerEvent, SignalKind,
};
pub use registry::ConnectionRegistry;
pub use rooms::{FrameSender, RoomManager, RoomStats};
pub use server::{GatewayConfig, GatewayError, GatewayServer, GatewayStats};
