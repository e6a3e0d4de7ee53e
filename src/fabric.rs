//! Broadcast fabric bootstrap: optional cross-instance fan-out.
//!
//! At startup the gateway tries to attach its room broadcasts to an external
//! pub/sub broker so that an event relayed on one instance reaches members
//! connected to every instance. Attachment needs two links — a publisher and
//! a dedicated subscriber — and is all-or-nothing: if either link fails
//! within its connect budget, both are released and the gateway runs with
//! process-local broadcast only. That fallback is a degraded mode, never a
//! startup failure.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use uuid::Uuid;

use crate::protocol::{RoomName, ServerEvent};
use crate::rooms::RoomManager;

/// Default budget for each fabric link at bootstrap.
pub const DEFAULT_FABRIC_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const CHANNEL_PREFIX: &str = "fabric:";
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Envelope published to the fabric for one room event.
///
/// The instance id lets each subscriber drop its own frames: local members
/// were already served by the in-process broadcast.
#[derive(Debug, Serialize, Deserialize)]
struct FabricFrame {
    instance: Uuid,
    room: String,
    event: ServerEvent,
}

/// Result of the bootstrap: either process-local broadcast or an attached
/// publisher link (the subscriber side runs as a detached task).
pub enum FabricHandle {
    Local,
    Remote {
        publish: MultiplexedConnection,
        instance: Uuid,
    },
}

impl FabricHandle {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Mirror a room event onto the fabric. Best-effort: publish failures
    /// are logged and never surface to the relaying connection.
    pub async fn publish(&self, room: &RoomName, event: &ServerEvent) {
        let Self::Remote { publish, instance } = self else {
            return;
        };
        let frame = FabricFrame {
            instance: *instance,
            room: room.to_string(),
            event: event.clone(),
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("fabric frame encode failed for {room}: {e}");
                return;
            }
        };
        let channel = format!("{CHANNEL_PREFIX}{room}");
        let mut conn = publish.clone();
        let op = conn.publish::<_, _, ()>(&channel, &payload);
        match timeout(PUBLISH_TIMEOUT, op).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("fabric publish failed for {room}: {e}"),
            Err(_) => log::warn!("fabric publish timed out for {room}"),
        }
    }
}

/// Attach room broadcasts to the fabric, or fall back to local-only.
///
/// Runs exactly once at startup. No endpoint configured means local
/// broadcast by design; a configured endpoint that cannot be fully attached
/// (either link erroring or exceeding `connect_timeout`) logs a warning,
/// drops any partially-opened link and also yields local broadcast.
pub async fn attach_fabric(
    url: Option<&str>,
    connect_timeout: Duration,
    rooms: Arc<RoomManager>,
) -> FabricHandle {
    let Some(url) = url else {
        log::info!("no broadcast fabric configured, using local broadcast");
        return FabricHandle::Local;
    };

    match try_attach(url, connect_timeout, rooms).await {
        Ok(handle) => {
            log::info!("broadcast fabric attached at {url}");
            handle
        }
        Err(e) => {
            // Partially-opened links were dropped with the error path.
            log::warn!("broadcast fabric unavailable, falling back to local broadcast: {e}");
            FabricHandle::Local
        }
    }
}

async fn try_attach(
    url: &str,
    connect_timeout: Duration,
    rooms: Arc<RoomManager>,
) -> Result<FabricHandle, redis::RedisError> {
    let client = redis::Client::open(url)?;

    let publish = timeout(connect_timeout, client.get_multiplexed_async_connection())
        .await
        .map_err(elapsed_to_redis)??;

    // Both links must come up; a publisher without a subscriber is not a
    // valid end state, so any failure from here drops `publish` too.
    let mut pubsub = timeout(connect_timeout, client.get_async_pubsub())
        .await
        .map_err(elapsed_to_redis)??;
    timeout(
        connect_timeout,
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")),
    )
    .await
    .map_err(elapsed_to_redis)??;

    let instance = Uuid::new_v4();
    tokio::spawn(run_subscriber(pubsub, instance, rooms));

    Ok(FabricHandle::Remote { publish, instance })
}

fn elapsed_to_redis(_: tokio::time::error::Elapsed) -> redis::RedisError {
    redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "fabric connect timed out",
    ))
}

/// Subscriber loop: re-deliver frames published by other instances to the
/// local members of the named room.
async fn run_subscriber(pubsub: redis::aio::PubSub, instance: Uuid, rooms: Arc<RoomManager>) {
    let mut stream = pubsub.into_on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("fabric frame payload unreadable: {e}");
                continue;
            }
        };
        let frame: FabricFrame = match serde_json::from_str(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("malformed fabric frame dropped: {e}");
                continue;
            }
        };
        if frame.instance == instance {
            continue;
        }
        let room: RoomName = match frame.room.parse() {
            Ok(room) => room,
            Err(e) => {
                log::warn!("fabric frame with bad room dropped: {e}");
                continue;
            }
        };
        if let Err(e) = rooms.deliver(&room, &frame.event).await {
            log::warn!("fabric frame delivery failed for {room}: {e}");
        }
    }
    log::warn!("fabric subscriber stream ended; cross-instance broadcast stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;

    #[tokio::test]
    async fn test_unconfigured_is_local() {
        let rooms = Arc::new(RoomManager::new());
        let handle = attach_fabric(None, DEFAULT_FABRIC_CONNECT_TIMEOUT, rooms).await;
        assert!(!handle.is_remote());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back_to_local() {
        let rooms = Arc::new(RoomManager::new());
        let handle = attach_fabric(
            Some("redis://127.0.0.1:1/"),
            Duration::from_millis(500),
            rooms,
        )
        .await;
        assert!(!handle.is_remote());
    }

    #[tokio::test]
    async fn test_garbage_url_falls_back_to_local() {
        let rooms = Arc::new(RoomManager::new());
        let handle = attach_fabric(Some("not a url"), Duration::from_millis(500), rooms).await;
        assert!(!handle.is_remote());
    }

    #[tokio::test]
    async fn test_local_publish_is_noop() {
        // Publishing through the local handle must be safe to call.
        let handle = FabricHandle::Local;
        let event = ServerEvent::Presence {
            subject_id: Uuid::new_v4(),
            status: PresenceStatus::Online,
        };
        handle
            .publish(&RoomName::Session(Uuid::new_v4()), &event)
            .await;
    }

    #[test]
    fn test_fabric_frame_roundtrip() {
        let frame = FabricFrame {
            instance: Uuid::new_v4(),
            room: RoomName::Session(Uuid::new_v4()).to_string(),
            event: ServerEvent::PeerLeft {
                subject_id: Uuid::new_v4(),
            },
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: FabricFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.instance, frame.instance);
        assert_eq!(decoded.room, frame.room);
        assert_eq!(decoded.event, frame.event);
        assert!(decoded.room.parse::<RoomName>().is_ok());
    }
}
