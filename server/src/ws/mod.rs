pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Role;
use crate::presence::PresenceCount;
use crate::proto::ServerMessage;

/// Sender half of a connection's outbound channel.
/// Anything holding a clone can push frames to that client.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Server-assigned id, unique per socket.
pub type ConnectionId = Uuid;

/// Named group of connections used for targeted pushes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Role(Role),
    User(String),
    Ride(String),
}

impl Room {
    pub fn ride(ride_id: &str) -> Self {
        Self::Ride(ride_id.to_string())
    }

    pub fn user(user_id: &str) -> Self {
        Self::User(user_id.to_string())
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role(role) => write!(f, "role:{}", role),
            Self::User(id) => write!(f, "user:{}", id),
            Self::Ride(id) => write!(f, "ride:{}", id),
        }
    }
}

impl FromStr for Room {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed room: {}", s))?;
        if id.is_empty() {
            return Err(format!("malformed room: {}", s));
        }
        match kind {
            "role" => Ok(Self::Role(id.parse()?)),
            "user" => Ok(Self::User(id.to_string())),
            "ride" => Ok(Self::Ride(id.to_string())),
            other => Err(format!("unknown room kind: {}", other)),
        }
    }
}

/// One live socket.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub user_id: String,
    pub role: Role,
    pub connected_at: DateTime<Utc>,
    pub rooms: HashSet<Room>,
    pub sender: ConnectionSender,
}

/// Live connections and room membership.
///
/// A user may hold any number of connections (devices, tabs). Every connection is in
/// `role:{role}` and `user:{userId}` for as long as it lives.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    rooms: Arc<DashMap<Room, HashSet<ConnectionId>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and place it in its role and user rooms.
    pub fn register(&self, user_id: &str, role: Role, sender: ConnectionSender) -> ConnectionId {
        let id = Uuid::now_v7();
        let base_rooms = [Room::Role(role), Room::user(user_id)];

        self.connections.insert(
            id,
            ConnectionEntry {
                id,
                user_id: user_id.to_string(),
                role,
                connected_at: Utc::now(),
                rooms: base_rooms.iter().cloned().collect(),
                sender,
            },
        );
        for room in base_rooms {
            self.rooms.entry(room).or_default().insert(id);
        }

        tracing::debug!(
            user_id = %user_id,
            connection_id = %id,
            connections = self.user_connection_count(user_id),
            "Connection registered"
        );
        id
    }

    /// Remove a connection from the registry and from every room it was in.
    /// Returns the removed entry, or None if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        let (_, entry) = self.connections.remove(&id)?;
        for room in &entry.rooms {
            self.remove_from_room(room, id);
        }
        tracing::debug!(
            user_id = %entry.user_id,
            connection_id = %id,
            "Connection unregistered"
        );
        Some(entry)
    }

    /// Put a connection in a room. Returns false if the connection is gone or
    /// was already a member.
    pub fn join(&self, id: ConnectionId, room: &Room) -> bool {
        // The entry guard is held across the room insert so `unregister` sees both or neither.
        // Nothing takes a connection guard while holding a room guard.
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        let added = entry.rooms.insert(room.clone());
        if added {
            self.rooms.entry(room.clone()).or_default().insert(id);
        }
        added
    }

    /// Take a connection out of a room. Base rooms cannot be left.
    pub fn leave(&self, id: ConnectionId, room: &Room) -> bool {
        let removed = match self.connections.get_mut(&id) {
            Some(mut entry) => {
                let is_base = match room {
                    Room::Role(r) => *r == entry.role,
                    Room::User(u) => *u == entry.user_id,
                    Room::Ride(_) => false,
                };
                !is_base && entry.rooms.remove(room)
            }
            None => return false,
        };
        if removed {
            self.remove_from_room(room, id);
        }
        removed
    }

    /// Join every connection of `user_id` to `room` and confirm with `room_joined`.
    pub fn join_user(&self, user_id: &str, room: &Room) {
        for id in self.members(&Room::user(user_id)) {
            if self.join(id, room) {
                self.send_to_connection(
                    id,
                    &ServerMessage::RoomJoined {
                        room: room.to_string(),
                    },
                );
            }
        }
    }

    /// Connection ids currently in a room.
    pub fn members(&self, room: &Room) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct user ids with at least one connection in the room.
    pub fn users_in_room(&self, room: &Room) -> HashSet<String> {
        self.members(room)
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|e| e.user_id.clone()))
            .collect()
    }

    /// Connections per role, recomputed from the live set.
    pub fn role_counts(&self) -> PresenceCount {
        let mut per_role: HashMap<Role, usize> = HashMap::new();
        for entry in self.connections.iter() {
            *per_role.entry(entry.role).or_default() += 1;
        }
        PresenceCount::from_roles(
            per_role.get(&Role::Driver).copied().unwrap_or(0),
            per_role.get(&Role::User).copied().unwrap_or(0),
            per_role.get(&Role::Admin).copied().unwrap_or(0),
        )
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.rooms
            .get(&Room::user(user_id))
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn is_member(&self, id: ConnectionId, room: &Room) -> bool {
        self.connections
            .get(&id)
            .map(|e| e.rooms.contains(room))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Push a message to every connection in the union of `rooms`.
    /// A connection in several of the rooms receives it once.
    /// Returns the number of connections reached.
    pub fn send_to_rooms(&self, rooms: &[Room], msg: &ServerMessage) -> usize {
        let Some(json) = msg.to_json() else {
            return 0;
        };
        let targets: HashSet<ConnectionId> =
            rooms.iter().flat_map(|room| self.members(room)).collect();

        let frame = Message::Text(json.into());
        let mut delivered = 0;
        for id in targets {
            if let Some(entry) = self.connections.get(&id) {
                if entry.sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Push a message to a single connection.
    pub fn send_to_connection(&self, id: ConnectionId, msg: &ServerMessage) -> bool {
        let Some(json) = msg.to_json() else {
            return false;
        };
        match self.connections.get(&id) {
            Some(entry) => entry.sender.send(Message::Text(json.into())).is_ok(),
            None => false,
        }
    }

    fn remove_from_room(&self, room: &Room, id: ConnectionId) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut ids) => {
                ids.remove(&id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, ids| ids.is_empty());
        }
    }
}
