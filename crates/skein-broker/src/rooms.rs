//! Room index
//!
//! Maps room id to the set of member sockets within one namespace. A room
//! entry exists iff it has at least one member. Mutation is exclusive per
//! room (dashmap entry lock); readers take a snapshot of the member list so
//! fan-out iteration is immune to concurrent leaves.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::socket::SocketId;

/// Room id to member set mapping for a single namespace
#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: DashMap<String, HashSet<SocketId>>,
}

impl RoomIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a socket to a room. Idempotent; returns `true` if newly added.
    pub fn join(&self, id: &SocketId, room: &str) -> bool {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.clone())
    }

    /// Remove a socket from a room. Silent no-op when absent; the room
    /// entry is dropped with its last member.
    pub fn leave(&self, id: &SocketId, room: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.rooms.entry(room.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(id);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Snapshot of the members of a room; empty for unknown rooms
    pub fn members(&self, room: &str) -> Vec<SocketId> {
        self.rooms
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `id` is currently in `room`
    pub fn contains(&self, room: &str, id: &SocketId) -> bool {
        self.rooms.get(room).is_some_and(|set| set.contains(id))
    }

    /// Remove a socket from every room in `rooms`
    pub fn cleanup_socket(&self, id: &SocketId, rooms: impl IntoIterator<Item = String>) {
        for room in rooms {
            self.leave(id, &room);
        }
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
