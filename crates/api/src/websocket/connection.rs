//! WebSocket connection management
//!
//! Represents an authenticated connection with its room subscriptions and a
//! bounded outbound queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use revroom_shared::{RoomId, UserId};

use super::events::ServerEvent;
use crate::auth::AuthUser;

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Authenticated user ID
    pub user_id: UserId,

    pub display_name: String,

    /// Bounded queue drained by the socket writer
    sender: mpsc::Sender<ServerEvent>,

    /// Rooms this connection is subscribed to
    subscriptions: Arc<RwLock<HashSet<RoomId>>>,

    evicted: AtomicBool,
    evict_signal: Notify,
}

impl Connection {
    /// Create a new connection
    pub fn new(user_id: UserId, display_name: String, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            display_name,
            sender,
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
            evicted: AtomicBool::new(false),
            evict_signal: Notify::new(),
        }
    }

    /// Identity used when the connection acts on rooms
    pub fn actor(&self) -> AuthUser {
        AuthUser {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
        }
    }

    /// Queue an event without waiting.
    ///
    /// Fails with `Full` when the client is not draining its queue and with
    /// `Closed` once the writer has gone away.
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::TrySendError<ServerEvent>> {
        if self.is_evicted() {
            return Err(mpsc::error::TrySendError::Closed(event));
        }
        self.sender.try_send(event)
    }

    /// Mark the connection for disconnection and wake its socket loop
    pub fn evict(&self) {
        if !self.evicted.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                session_id = %self.session_id,
                user_id = %self.user_id,
                "Evicting slow WebSocket connection"
            );
        }
        self.evict_signal.notify_one();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been evicted
    pub async fn evicted(&self) {
        if self.is_evicted() {
            return;
        }
        self.evict_signal.notified().await;
    }

    /// Subscribe to a room
    pub async fn subscribe(&self, room_id: RoomId) {
        let mut subs = self.subscriptions.write().await;
        subs.insert(room_id);
        tracing::debug!(
            session_id = %self.session_id,
            room_id = %room_id,
            "Subscribed to room"
        );
    }

    /// Unsubscribe from a room
    pub async fn unsubscribe(&self, room_id: RoomId) {
        let mut subs = self.subscriptions.write().await;
        subs.remove(&room_id);
        tracing::debug!(
            session_id = %self.session_id,
            room_id = %room_id,
            "Unsubscribed from room"
        );
    }

    pub async fn is_subscribed(&self, room_id: &RoomId) -> bool {
        let subs = self.subscriptions.read().await;
        subs.contains(room_id)
    }
}
