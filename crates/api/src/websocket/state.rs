//! Presence management
//!
//! Registry of live connections plus the room groups they subscribe to.
//! A client that stops draining its queue is evicted instead of slowing the
//! broadcaster down.
//!
//! Events that follow a store write go through [`PresenceManager::publish`]
//! with the write's room sequence number and are released in that order.
//! Typing and highlight events carry no state and use the plain broadcasts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use revroom_shared::{RoomId, UserId};

use super::connection::Connection;
use super::events::ServerEvent;
use super::outbox::{Fanout, RoomOutbox};
use super::room::RoomGroups;

/// How long a room waits on a sequence number whose publisher never shows up
/// (a cancelled request, or a write made by another instance)
const GAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared presence state, cheap to clone
#[derive(Clone)]
pub struct PresenceManager {
    /// All active connections indexed by session_id
    connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,

    rooms: Arc<RoomGroups>,

    outboxes: Arc<RwLock<HashMap<RoomId, Arc<Mutex<RoomOutbox>>>>>,

    /// Capacity of each connection's outbound queue
    send_buffer: usize,
}

impl PresenceManager {
    pub fn new(send_buffer: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RoomGroups::new()),
            outboxes: Arc::new(RwLock::new(HashMap::new())),
            send_buffer: send_buffer.max(1),
        }
    }

    /// Register an authenticated connection. The returned receiver feeds the
    /// socket writer.
    pub async fn attach_identity(
        &self,
        user_id: UserId,
        display_name: String,
    ) -> (Arc<Connection>, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let conn = Arc::new(Connection::new(user_id, display_name, tx));

        let mut connections = self.connections.write().await;
        connections.insert(conn.session_id, Arc::clone(&conn));

        tracing::info!(
            session_id = %conn.session_id,
            user_id = %conn.user_id,
            total_connections = connections.len(),
            "WebSocket connection added"
        );

        (conn, rx)
    }

    /// Drop a connection from the registry and every room group.
    /// Returns the rooms it was subscribed to.
    pub async fn detach(&self, session_id: &Uuid) -> Vec<RoomId> {
        let removed = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(session_id);
            if let Some(conn) = &removed {
                tracing::info!(
                    session_id = %session_id,
                    user_id = %conn.user_id,
                    remaining_connections = connections.len(),
                    "WebSocket connection removed"
                );
            }
            removed
        };

        let rooms = self.rooms.remove_connection(session_id).await;
        if let Some(conn) = removed {
            for room_id in &rooms {
                conn.unsubscribe(*room_id).await;
            }
        }
        rooms
    }

    pub async fn subscribe(&self, conn: &Arc<Connection>, room_id: RoomId) {
        conn.subscribe(room_id).await;
        self.rooms.join(room_id, Arc::clone(conn)).await;
    }

    pub async fn unsubscribe(&self, conn: &Connection, room_id: RoomId) {
        conn.unsubscribe(room_id).await;
        self.rooms.leave(&room_id, &conn.session_id).await;
    }

    pub async fn is_primed(&self, room_id: &RoomId) -> bool {
        self.outboxes.read().await.contains_key(room_id)
    }

    /// Start ordering a room's events after `last_seq`. Must happen before
    /// the first write this process publishes for the room; later calls are
    /// no-ops.
    pub async fn prime(&self, room_id: RoomId, last_seq: u64) {
        self.outboxes
            .write()
            .await
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(RoomOutbox::new(last_seq + 1))));
    }

    async fn outbox(&self, room_id: RoomId, seq: u64) -> Arc<Mutex<RoomOutbox>> {
        if let Some(outbox) = self.outboxes.read().await.get(&room_id) {
            return Arc::clone(outbox);
        }
        let mut outboxes = self.outboxes.write().await;
        Arc::clone(
            outboxes
                .entry(room_id)
                .or_insert_with(|| Arc::new(Mutex::new(RoomOutbox::new(seq)))),
        )
    }

    /// Release the events of the write committed as `seq` once every earlier
    /// write in the room has been released. An empty batch still has to be
    /// published so later writes are not held back.
    pub async fn publish(&self, room_id: RoomId, seq: u64, batch: Vec<Fanout>) {
        let outbox = self.outbox(room_id, seq).await;
        let stalled = {
            let mut outbox = outbox.lock().await;
            let ready = outbox.accept(seq, batch);
            let stalled = self.deliver(room_id, ready).await;
            if let Some(missing) = outbox.needs_watch() {
                self.watch_gap(room_id, missing);
            }
            stalled
        };
        self.evict_all(stalled).await;
    }

    fn watch_gap(&self, room_id: RoomId, missing: u64) {
        let presence = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GAP_TIMEOUT).await;
            presence.release_gap(room_id, missing).await;
        });
    }

    async fn release_gap(&self, room_id: RoomId, missing: u64) {
        let Some(outbox) = self.outboxes.read().await.get(&room_id).cloned() else {
            return;
        };
        let stalled = {
            let mut outbox = outbox.lock().await;
            let ready = outbox.skip(missing);
            if !ready.is_empty() {
                tracing::warn!(
                    room_id = %room_id,
                    missing,
                    released = ready.len(),
                    "Gave up waiting for room event, releasing later events"
                );
            }
            let stalled = self.deliver(room_id, ready).await;
            if let Some(next_missing) = outbox.needs_watch() {
                self.watch_gap(room_id, next_missing);
            }
            stalled
        };
        self.evict_all(stalled).await;
    }

    async fn deliver(&self, room_id: RoomId, ready: Vec<Fanout>) -> Vec<Uuid> {
        let mut stalled = Vec::new();
        for fanout in ready {
            let delivery = self
                .rooms
                .broadcast(&room_id, &fanout.event, fanout.except)
                .await;
            stalled.extend(delivery.stalled);
        }
        stalled
    }

    /// Deliver to every subscriber of the room
    pub async fn broadcast(&self, room_id: RoomId, event: ServerEvent) {
        let delivery = self.rooms.broadcast(&room_id, &event, None).await;
        self.evict_all(delivery.stalled).await;
    }

    /// Deliver to every subscriber of the room except one session
    pub async fn broadcast_except(&self, room_id: RoomId, except: Uuid, event: ServerEvent) {
        let delivery = self.rooms.broadcast(&room_id, &event, Some(except)).await;
        self.evict_all(delivery.stalled).await;
    }

    /// Deliver to every live connection of a user, regardless of room
    pub async fn broadcast_to_user(&self, user_id: &UserId, event: ServerEvent) {
        let targets = self.get_user_connections(user_id).await;
        let mut stalled = Vec::new();
        for conn in targets {
            if let Err(mpsc::error::TrySendError::Full(_)) = conn.send(event.clone()) {
                stalled.push(conn.session_id);
            }
        }
        self.evict_all(stalled).await;
    }

    /// Reply to a single connection
    pub async fn send_to(&self, conn: &Connection, event: ServerEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = conn.send(event) {
            self.evict(&conn.session_id).await;
        }
    }

    /// Disconnect a connection whose queue overflowed
    pub async fn evict(&self, session_id: &Uuid) {
        let conn = self.get_connection(session_id).await;
        if let Some(conn) = conn {
            conn.evict();
        }
    }

    async fn evict_all(&self, sessions: Vec<Uuid>) {
        for session_id in sessions {
            self.evict(&session_id).await;
        }
    }

    /// Whether the user still has a subscribed connection in the room
    pub async fn is_user_in_room(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        self.rooms.has_user(room_id, user_id).await
    }

    /// Subscribed connections in a room
    pub async fn room_size(&self, room_id: &RoomId) -> usize {
        self.rooms.get_room_size(room_id).await
    }

    pub async fn get_connection(&self, session_id: &Uuid) -> Option<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections.get(session_id).cloned()
    }

    pub async fn get_user_connections(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.user_id == *user_id)
            .cloned()
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }

    pub async fn get_stats(&self) -> PresenceStats {
        PresenceStats {
            active_connections: self.connection_count().await,
            active_rooms: self.rooms.get_room_count().await,
        }
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Statistics about live connections
#[derive(Debug, Clone, serde::Serialize)]
pub struct PresenceStats {
    pub active_connections: usize,
    /// Rooms with at least one subscribed connection
    pub active_rooms: usize,
}
