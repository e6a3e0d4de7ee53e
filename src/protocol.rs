//! JSON wire protocol for the collaboration gateway.
//!
//! Every frame is a single WebSocket text message carrying a tagged JSON
//! object. Client frames name a session and an operation; server frames are
//! either acks/errors for the sending connection or relayed events stamped
//! with the *authenticated* sender identity — a payload can never speak for
//! a different subject than the connection that sent it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// WebRTC signaling sub-kinds. Offer, answer and ICE candidates share
/// identical addressing rules, so they are one event with a kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

/// Advisory online/offline marker carried by presence notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Frames sent by a client after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Request membership in a session room.
    JoinSession { session_id: Uuid },
    /// Leave a session room.
    LeaveSession { session_id: Uuid },
    /// Point-to-point WebRTC signaling, addressed to one subject.
    Signal {
        session_id: Uuid,
        kind: SignalKind,
        payload: serde_json::Value,
        target_subject_id: Uuid,
    },
    /// Code buffer change, relayed to the session room.
    Edit {
        session_id: Uuid,
        changes: serde_json::Value,
    },
    /// Editor cursor movement, relayed to the session room.
    Cursor {
        session_id: Uuid,
        position: serde_json::Value,
    },
    /// Whiteboard stroke, relayed to the session room.
    Draw {
        session_id: Uuid,
        stroke: serde_json::Value,
    },
    /// Whiteboard wipe, relayed to the session room.
    ClearBoard { session_id: Uuid },
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Join acknowledgement for the requesting connection.
    Joined { session_id: Uuid },
    /// Operation-level error; the connection stays open.
    Error { message: String },
    /// Another participant joined the session room.
    PeerJoined { subject_id: Uuid, name: String },
    /// A participant left the session room (or disconnected).
    PeerLeft { subject_id: Uuid },
    /// Presence transition of a subject in the recipient's peer set.
    Presence {
        subject_id: Uuid,
        status: PresenceStatus,
    },
    /// Relayed signaling, delivered only to the target subject's connections.
    Signal {
        session_id: Uuid,
        kind: SignalKind,
        payload: serde_json::Value,
        from_subject_id: Uuid,
        target_subject_id: Uuid,
    },
    Edit {
        session_id: Uuid,
        changes: serde_json::Value,
        from_subject_id: Uuid,
    },
    Cursor {
        session_id: Uuid,
        position: serde_json::Value,
        from_subject_id: Uuid,
    },
    Draw {
        session_id: Uuid,
        stroke: serde_json::Value,
        from_subject_id: Uuid,
    },
    ClearBoard {
        session_id: Uuid,
        from_subject_id: Uuid,
    },
}

impl ClientEvent {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerEvent {
    /// Convenience constructor for operation errors.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// A named broadcast scope.
///
/// `Session` rooms hold every connection currently collaborating on one
/// session. `Subject` rooms hold all of one subject's connections (multiple
/// tabs/devices) and exist for point-to-point delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomName {
    Session(Uuid),
    Subject(Uuid),
}

impl std::fmt::Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Subject(id) => write!(f, "subject:{id}"),
        }
    }
}

impl std::str::FromStr for RoomName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidRoom(s.to_string()))?;
        let id = Uuid::parse_str(id).map_err(|_| ProtocolError::InvalidRoom(s.to_string()))?;
        match kind {
            "session" => Ok(Self::Session(id)),
            "subject" => Ok(Self::Subject(id)),
            _ => Err(ProtocolError::InvalidRoom(s.to_string())),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid room name: {0}")]
    InvalidRoom(String),
    #[error("connection closed")]
    ConnectionClosed,
}
