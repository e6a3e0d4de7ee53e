//! Read-only lookups against the surrounding platform.
//!
//! The gateway never owns accounts, sessions or the friend graph; it asks an
//! external collaborator three questions: who is this subject, who may be in
//! this session, and whose peer set should hear about a presence change.
//! The trait seam lets hosts wire in their real store while tests and demos
//! use the in-memory implementation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Role surfaced by the identity lookup. The gateway trusts this, never
/// role data carried in event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Candidate,
    Interviewer,
}

/// Subject identity as the platform knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectProfile {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
}

/// Dependency-unavailable errors from the platform.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Downstream platform queries consumed by the gateway.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Identity lookup by subject id. `None` means no such subject
    /// (e.g. a deleted account holding a still-valid credential).
    async fn find_subject(&self, id: Uuid) -> Result<Option<SubjectProfile>, DirectoryError>;

    /// Participant list for a session. `None` means no such session.
    async fn session_participants(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Vec<Uuid>>, DirectoryError>;

    /// Peer set for presence fan-out (the social graph).
    async fn peers_of(&self, id: Uuid) -> Result<Vec<Uuid>, DirectoryError>;
}

#[derive(Default)]
struct DirectoryState {
    subjects: HashMap<Uuid, SubjectProfile>,
    sessions: HashMap<Uuid, Vec<Uuid>>,
    peers: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory directory for tests and embedding hosts without a platform.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // Seed data stays usable even if a writer panicked mid-test.
    fn read(&self) -> RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a subject, returning its id for convenience.
    pub fn add_subject(&self, name: impl Into<String>, role: Role) -> Uuid {
        let id = Uuid::new_v4();
        let profile = SubjectProfile {
            id,
            name: name.into(),
            role,
        };
        self.write().subjects.insert(id, profile);
        id
    }

    /// Seed a session with its participant list, returning the session id.
    pub fn add_session(&self, participants: Vec<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.write().sessions.insert(id, participants);
        id
    }

    /// Declare `peer` part of `subject`'s peer set (one direction).
    pub fn add_peer(&self, subject: Uuid, peer: Uuid) {
        self.write().peers.entry(subject).or_default().push(peer);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn find_subject(&self, id: Uuid) -> Result<Option<SubjectProfile>, DirectoryError> {
        Ok(self.read().subjects.get(&id).cloned())
    }

    async fn session_participants(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Vec<Uuid>>, DirectoryError> {
        Ok(self.read().sessions.get(&session_id).cloned())
    }

    async fn peers_of(&self, id: Uuid) -> Result<Vec<Uuid>, DirectoryError> {
        Ok(self.read().peers.get(&id).cloned().unwrap_or_default())
    }
}
