//! Room groups for pub/sub
//!
//! Tracks which connections are subscribed to each revision room.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc::error::TrySendError, RwLock};
use uuid::Uuid;

use revroom_shared::{RoomId, UserId};

use super::connection::Connection;
use super::events::ServerEvent;

/// Outcome of a fan-out
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    /// Sessions whose queue was full or closed
    pub stalled: Vec<Uuid>,
}

/// Manages room subscription groups
pub struct RoomGroups {
    /// Map of room_id -> subscribed connections
    rooms: Arc<RwLock<HashMap<RoomId, Vec<Arc<Connection>>>>>,
}

impl RoomGroups {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a connection to a room group. Joining twice is a no-op.
    pub async fn join(&self, room_id: RoomId, conn: Arc<Connection>) {
        let mut rooms = self.rooms.write().await;
        let conns = rooms.entry(room_id).or_default();
        if !conns.iter().any(|c| c.session_id == conn.session_id) {
            conns.push(Arc::clone(&conn));
        }

        tracing::debug!(
            room_id = %room_id,
            session_id = %conn.session_id,
            room_size = conns.len(),
            "Connection joined room group"
        );
    }

    /// Remove a connection from a room group
    pub async fn leave(&self, room_id: &RoomId, session_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(conns) = rooms.get_mut(room_id) {
            conns.retain(|c| c.session_id != *session_id);

            if conns.is_empty() {
                rooms.remove(room_id);
                tracing::debug!(room_id = %room_id, "Removed empty room group");
            }
        }
    }

    /// Queue an event for every subscriber of a room, optionally skipping
    /// one session. Never waits on a slow client.
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        event: &ServerEvent,
        except: Option<Uuid>,
    ) -> Delivery {
        let rooms = self.rooms.read().await;
        let mut delivery = Delivery::default();

        let Some(conns) = rooms.get(room_id) else {
            tracing::debug!(
                room_id = %room_id,
                event = event.name(),
                "No subscribers for room"
            );
            return delivery;
        };

        for conn in conns {
            if Some(conn.session_id) == except {
                continue;
            }
            match conn.send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => delivery.stalled.push(conn.session_id),
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        session_id = %conn.session_id,
                        "Skipping closed connection"
                    );
                }
            }
        }

        tracing::debug!(
            room_id = %room_id,
            event = event.name(),
            recipients = delivery.delivered,
            stalled = delivery.stalled.len(),
            "Broadcast event to room"
        );

        delivery
    }

    /// Remove a connection from all room groups, returning the rooms it left
    pub async fn remove_connection(&self, session_id: &Uuid) -> Vec<RoomId> {
        let mut rooms = self.rooms.write().await;
        let mut removed_from = Vec::new();

        for (room_id, conns) in rooms.iter_mut() {
            let before_len = conns.len();
            conns.retain(|c| c.session_id != *session_id);
            if conns.len() < before_len {
                removed_from.push(*room_id);
            }
        }

        rooms.retain(|_, conns| !conns.is_empty());

        if !removed_from.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                room_count = removed_from.len(),
                "Removed connection from room groups"
            );
        }

        removed_from
    }

    /// Whether any connection of this user is subscribed to the room
    pub async fn has_user(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .is_some_and(|conns| conns.iter().any(|c| c.user_id == *user_id))
    }

    pub async fn get_room_size(&self, room_id: &RoomId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(Vec::len).unwrap_or(0)
    }

    pub async fn get_room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }
}

impl Default for RoomGroups {
    fn default() -> Self {
        Self::new()
    }
}
