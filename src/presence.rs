//! Advisory presence markers with graceful degradation.
//!
//! Presence is a hint, not truth: the connection registry decides "currently
//! connected", this store only records "recently online" with a bounded TTL.
//! Every operation is failure-absorbing — an unreachable store logs and
//! returns a safe default instead of erroring or blocking, so losing the
//! store can never stall or crash connection handling.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::time::timeout;
use uuid::Uuid;

/// Default TTL for an online marker; refreshed on every `mark_online`.
pub const DEFAULT_PRESENCE_TTL_SECS: u64 = 300;

/// Default per-operation deadline. Presence is best-effort, so the budget
/// is short.
pub const DEFAULT_PRESENCE_OP_TIMEOUT: Duration = Duration::from_secs(2);

fn presence_key(subject: Uuid) -> String {
    format!("presence:{subject}")
}

/// Capability interface for the presence store.
///
/// Selected once at startup: the live Redis-backed store when configured and
/// reachable, the no-op stand-in otherwise. Call sites never branch on
/// availability themselves.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record the subject as online, refreshing the TTL. Best-effort.
    async fn mark_online(&self, subject: Uuid);
    /// Delete the subject's online marker immediately. Best-effort.
    async fn mark_offline(&self, subject: Uuid);
    /// Whether an unexpired online marker exists. Degrades to `false`.
    async fn is_online(&self, subject: Uuid) -> bool;
}

/// Stand-in used when no backing store is configured or reachable.
pub struct NoopPresence;

#[async_trait]
impl PresenceStore for NoopPresence {
    async fn mark_online(&self, subject: Uuid) {
        log::debug!("presence disabled, skipping mark_online for {subject}");
    }

    async fn mark_offline(&self, subject: Uuid) {
        log::debug!("presence disabled, skipping mark_offline for {subject}");
    }

    async fn is_online(&self, _subject: Uuid) -> bool {
        false
    }
}

/// Redis-backed presence store.
///
/// Keys follow `presence:<subject>`; online markers carry a TTL and are
/// deleted outright on offline.
pub struct RedisPresence {
    conn: MultiplexedConnection,
    ttl_secs: u64,
    op_timeout: Duration,
}

impl RedisPresence {
    pub fn new(conn: MultiplexedConnection, ttl_secs: u64, op_timeout: Duration) -> Self {
        Self {
            conn,
            ttl_secs,
            op_timeout,
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn mark_online(&self, subject: Uuid) {
        let key = presence_key(subject);
        let mut conn = self.conn.clone();
        let op = conn.set_ex::<_, _, ()>(&key, "online", self.ttl_secs);
        match timeout(self.op_timeout, op).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("presence mark_online failed for {subject}: {e}"),
            Err(_) => log::warn!("presence mark_online timed out for {subject}"),
        }
    }

    async fn mark_offline(&self, subject: Uuid) {
        let key = presence_key(subject);
        let mut conn = self.conn.clone();
        let op = conn.del::<_, ()>(&key);
        match timeout(self.op_timeout, op).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("presence mark_offline failed for {subject}: {e}"),
            Err(_) => log::warn!("presence mark_offline timed out for {subject}"),
        }
    }

    async fn is_online(&self, subject: Uuid) -> bool {
        let key = presence_key(subject);
        let mut conn = self.conn.clone();
        let op = conn.exists::<_, bool>(&key);
        match timeout(self.op_timeout, op).await {
            Ok(Ok(exists)) => exists,
            Ok(Err(e)) => {
                log::warn!("presence is_online failed for {subject}: {e}");
                false
            }
            Err(_) => {
                log::warn!("presence is_online timed out for {subject}");
                false
            }
        }
    }
}

/// Connect the presence store, falling back to the no-op stand-in.
///
/// The initial connect is bounded by `connect_timeout`; any failure selects
/// `NoopPresence` with a warning rather than propagating an error.
pub async fn connect_presence(
    url: Option<&str>,
    ttl_secs: u64,
    op_timeout: Duration,
    connect_timeout: Duration,
) -> std::sync::Arc<dyn PresenceStore> {
    let Some(url) = url else {
        log::info!("no presence store configured, presence markers disabled");
        return std::sync::Arc::new(NoopPresence);
    };

    let client = match redis::Client::open(url) {
        Ok(client) => client,
        Err(e) => {
            log::warn!("invalid presence store url, presence markers disabled: {e}");
            return std::sync::Arc::new(NoopPresence);
        }
    };

    match timeout(connect_timeout, client.get_multiplexed_async_connection()).await {
        Ok(Ok(conn)) => {
            log::info!("presence store connected ({ttl_secs}s ttl)");
            std::sync::Arc::new(RedisPresence::new(conn, ttl_secs, op_timeout))
        }
        Ok(Err(e)) => {
            log::warn!("presence store unreachable, presence markers disabled: {e}");
            std::sync::Arc::new(NoopPresence)
        }
        Err(_) => {
            log::warn!("presence store connect timed out, presence markers disabled");
            std::sync::Arc::new(NoopPresence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_key_pattern() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            presence_key(id),
            "presence:550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[tokio::test]
    async fn test_noop_is_silent_and_safe() {
        let store = NoopPresence;
        let subject = Uuid::new_v4();
        store.mark_online(subject).await;
        assert!(!store.is_online(subject).await);
        store.mark_offline(subject).await;
        assert!(!store.is_online(subject).await);
    }

    #[tokio::test]
    async fn test_unconfigured_selects_noop() {
        let store = connect_presence(
            None,
            DEFAULT_PRESENCE_TTL_SECS,
            DEFAULT_PRESENCE_OP_TIMEOUT,
            Duration::from_secs(1),
        )
        .await;
        assert!(!store.is_online(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_unreachable_store_selects_noop() {
        // Port 1 is never a redis server; connect must fail or time out and
        // the caller must get the degraded store, not an error.
        let store = connect_presence(
            Some("redis://127.0.0.1:1/"),
            DEFAULT_PRESENCE_TTL_SECS,
            DEFAULT_PRESENCE_OP_TIMEOUT,
            Duration::from_millis(500),
        )
        .await;
        let subject = Uuid::new_v4();
        store.mark_online(subject).await;
        assert!(!store.is_online(subject).await);
    }

    #[tokio::test]
    async fn test_garbage_url_selects_noop() {
        let store = connect_presence(
            Some("not a url"),
            DEFAULT_PRESENCE_TTL_SECS,
            DEFAULT_PRESENCE_OP_TIMEOUT,
            Duration::from_millis(500),
        )
        .await;
        assert!(!store.is_online(Uuid::new_v4()).await);
    }
}
