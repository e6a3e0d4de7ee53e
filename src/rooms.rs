//! Room membership and fan-out.
//!
//! Each room maps member connections to their outbound frame channels.
//! Broadcasting encodes the event once and pushes the frame onto every
//! member's channel; the per-connection writer task drains its channel in
//! order, so one sender's events reach each recipient in emission order.
//! Membership is the relay guard: broadcasting *from* a connection that is
//! not a member of the room is a no-op by construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, RoomName, ServerEvent};

/// Outbound channel of pre-encoded JSON frames for one connection.
pub type FrameSender = mpsc::UnboundedSender<String>;

/// Fan-out counters, tracked with atomics off the delivery path's locks.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub active_rooms: usize,
}

struct AtomicRoomStats {
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

struct Member {
    subject: Uuid,
    tx: FrameSender,
}

/// A single broadcast scope.
struct Room {
    members: RwLock<HashMap<Uuid, Member>>,
}

impl Room {
    fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
        }
    }
}

/// Maps room names to live rooms and routes events into them.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomName, Arc<Room>>>,
    stats: Arc<AtomicRoomStats>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats: Arc::new(AtomicRoomStats {
                frames_delivered: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// The member insert happens while the room map lock is held so a
    /// concurrent `leave` cannot garbage-collect the freshly created room
    /// out from under the join.
    pub async fn join(&self, name: RoomName, conn: Uuid, subject: Uuid, tx: FrameSender) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(name)
            .or_insert_with(|| Arc::new(Room::new()))
            .clone();
        room.members.write().await.insert(conn, Member { subject, tx });
    }

    /// Remove a connection from a room. Empty rooms are dropped.
    ///
    /// Returns `true` if the connection was a member.
    pub async fn leave(&self, room: &RoomName, conn: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get(room).cloned() else {
            return false;
        };
        let mut members = entry.members.write().await;
        let removed = members.remove(&conn).is_some();
        if members.is_empty() {
            drop(members);
            rooms.remove(room);
        }
        removed
    }

    /// Remove a connection from every room it belongs to.
    ///
    /// Returns the rooms it was removed from, for close-time notification.
    pub async fn leave_all(&self, conn: Uuid) -> Vec<RoomName> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        let mut emptied = Vec::new();
        for (name, room) in rooms.iter() {
            let mut members = room.members.write().await;
            if members.remove(&conn).is_some() {
                left.push(*name);
                if members.is_empty() {
                    emptied.push(*name);
                }
            }
        }
        for name in emptied {
            rooms.remove(&name);
        }
        left
    }

    /// Broadcast to every member of the room except `origin`.
    ///
    /// Returns `None` (without delivering anything) when the room does not
    /// exist or the origin is not a member; otherwise the number of members
    /// the frame was handed to.
    pub async fn broadcast_from(
        &self,
        room: &RoomName,
        origin: Uuid,
        event: &ServerEvent,
    ) -> Result<Option<usize>, ProtocolError> {
        let Some(entry) = self.rooms.read().await.get(room).cloned() else {
            return Ok(None);
        };
        let frame = event.encode()?;
        let members = entry.members.read().await;
        if !members.contains_key(&origin) {
            return Ok(None);
        }
        let mut delivered = 0;
        for (conn, member) in members.iter() {
            if *conn == origin {
                continue;
            }
            self.push(member, frame.clone());
            delivered += 1;
        }
        Ok(Some(delivered))
    }

    /// Deliver to every member of the room.
    ///
    /// Used for point-to-point subject rooms and for frames arriving from
    /// other gateway instances over the fabric, where the origin connection
    /// does not exist locally.
    pub async fn deliver(&self, room: &RoomName, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let Some(entry) = self.rooms.read().await.get(room).cloned() else {
            return Ok(0);
        };
        let frame = event.encode()?;
        let members = entry.members.read().await;
        for member in members.values() {
            self.push(member, frame.clone());
        }
        Ok(members.len())
    }

    fn push(&self, member: &Member, frame: String) {
        if member.tx.send(frame).is_ok() {
            self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            // Receiver already dropped; the close path will reap membership.
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn is_member(&self, room: &RoomName, conn: Uuid) -> bool {
        match self.rooms.read().await.get(room) {
            Some(entry) => entry.members.read().await.contains_key(&conn),
            None => false,
        }
    }

    pub async fn member_count(&self, room: &RoomName) -> usize {
        match self.rooms.read().await.get(room) {
            Some(entry) => entry.members.read().await.len(),
            None => 0,
        }
    }

    /// Subjects currently in the room, deduplicated across connections.
    pub async fn subjects_in(&self, room: &RoomName) -> Vec<Uuid> {
        let Some(entry) = self.rooms.read().await.get(room).cloned() else {
            return Vec::new();
        };
        let members = entry.members.read().await;
        let mut subjects: Vec<Uuid> = members.values().map(|m| m.subject).collect();
        subjects.sort_unstable();
        subjects.dedup();
        subjects
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_rooms: self.rooms.read().await.len(),
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
