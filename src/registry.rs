//! Connection registry: the authority for "who is connected right now".
//!
//! Maps each subject to its live connection set (multiple tabs/devices) and
//! each connection back to its owner. This is the single shared mutable
//! structure in the gateway and the serialization point for presence
//! transitions: the online edge is decided atomically with registration,
//! the offline edge with the removal of a subject's last connection.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct RegistryInner {
    /// subject id → live connection ids
    subjects: HashMap<Uuid, HashSet<Uuid>>,
    /// connection id → owning subject (reverse map)
    owners: HashMap<Uuid, Uuid>,
}

/// Concurrency-safe subject ↔ connection bookkeeping.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a connection for a subject.
    ///
    /// Returns `true` iff this is the subject's first live connection — the
    /// edge callers use to emit an online transition exactly once.
    pub async fn register(&self, subject: Uuid, conn: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        inner.owners.insert(conn, subject);
        let set = inner.subjects.entry(subject).or_default();
        let first = set.is_empty();
        set.insert(conn);
        first
    }

    /// Remove a connection, resolving its owner through the reverse map.
    ///
    /// Returns the owning subject and whether this was its last connection
    /// (the offline edge). Idempotent: an unknown or already-removed
    /// connection is a no-op returning `None`.
    pub async fn unregister(&self, conn: Uuid) -> Option<(Uuid, bool)> {
        let mut inner = self.inner.write().await;
        let subject = inner.owners.remove(&conn)?;
        let last = match inner.subjects.get_mut(&subject) {
            Some(set) => {
                set.remove(&conn);
                set.is_empty()
            }
            None => true,
        };
        if last {
            inner.subjects.remove(&subject);
        }
        Some((subject, last))
    }

    /// True iff the subject has at least one live connection.
    pub async fn is_online(&self, subject: Uuid) -> bool {
        self.inner
            .read()
            .await
            .subjects
            .get(&subject)
            .is_some_and(|set| !set.is_empty())
    }

    /// All live connection ids for a subject.
    pub async fn connections_of(&self, subject: Uuid) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .subjects
            .get(&subject)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Owning subject of a connection, if registered.
    pub async fn subject_of(&self, conn: Uuid) -> Option<Uuid> {
        self.inner.read().await.owners.get(&conn).copied()
    }

    /// Number of subjects with at least one connection.
    pub async fn subject_count(&self) -> usize {
        self.inner.read().await.subjects.len()
    }

    /// Total number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.owners.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_first_connection_edge() {
        let registry = ConnectionRegistry::new();
        let subject = Uuid::new_v4();

        assert!(registry.register(subject, Uuid::new_v4()).await);
        // Second tab: not a first-connection edge
        assert!(!registry.register(subject, Uuid::new_v4()).await);
        assert!(registry.is_online(subject).await);
        assert_eq!(registry.connection_count().await, 2);
        assert_eq!(registry.subject_count().await, 1);
    }

    #[tokio::test]
    async fn test_offline_edge_fires_on_last_connection() {
        let registry = ConnectionRegistry::new();
        let subject = Uuid::new_v4();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        registry.register(subject, conn_a).await;
        registry.register(subject, conn_b).await;

        assert_eq!(registry.unregister(conn_a).await, Some((subject, false)));
        assert!(registry.is_online(subject).await);

        assert_eq!(registry.unregister(conn_b).await, Some((subject, true)));
        assert!(!registry.is_online(subject).await);
        assert_eq!(registry.subject_count().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let registry = ConnectionRegistry::new();
        let subject = Uuid::new_v4();
        let conn = Uuid::new_v4();
        registry.register(subject, conn).await;

        assert_eq!(registry.unregister(conn).await, Some((subject, true)));
        assert_eq!(registry.unregister(conn).await, None);
        assert_eq!(registry.unregister(Uuid::new_v4()).await, None);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_reverse_lookup() {
        let registry = ConnectionRegistry::new();
        let subject = Uuid::new_v4();
        let conn = Uuid::new_v4();
        registry.register(subject, conn).await;

        assert_eq!(registry.subject_of(conn).await, Some(subject));
        assert_eq!(registry.connections_of(subject).await, vec![conn]);
        assert_eq!(registry.subject_of(Uuid::new_v4()).await, None);
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister() {
        use std::sync::Arc;
        let registry = Arc::new(ConnectionRegistry::new());
        let subject = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let conn = Uuid::new_v4();
                registry.register(subject, conn).await;
                registry.unregister(conn).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(!registry.is_online(subject).await);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.subject_count().await, 0);
    }

    #[tokio::test]
    async fn test_offline_edge_fires_exactly_once_under_contention() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let registry = Arc::new(ConnectionRegistry::new());
        let subject = Uuid::new_v4();
        let conns: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
        for &conn in &conns {
            registry.register(subject, conn).await;
        }

        let offline_edges = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for conn in conns {
            let registry = registry.clone();
            let offline_edges = offline_edges.clone();
            handles.push(tokio::spawn(async move {
                if let Some((_, true)) = registry.unregister(conn).await {
                    offline_edges.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(offline_edges.load(Ordering::SeqCst), 1);
    }
}
