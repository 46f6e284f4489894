//! Room, message and poll event handlers
//!
//! Both transports go through these handlers: the WebSocket gateway via
//! [`Dispatcher::dispatch`] and the HTTP controllers by calling the handler
//! methods directly. A handler validates, performs one store operation and
//! then publishes the outcome under the sequence number the store assigned,
//! so subscribers only hear about committed state and hear it in commit
//! order. Nothing fallible may run between the commit and its publish.

pub mod message;
pub mod poll;
pub mod room;


use std::sync::Arc;

use revroom_shared::{MessageStore, Page, PollStore, Room, RoomFilter, RoomId, RoomStore, UserId};

use crate::error::{ApiError, ApiResult};
use crate::poll_expiry::PollScheduler;
use crate::websocket::{ClientEvent, Connection, PresenceManager, ServerEvent};

pub use message::{MessageHandler, OutgoingMessage};
pub use poll::{PollHandler, PollResults};
pub use room::RoomHandler;

/// Collaborators shared by every handler
pub struct Services {
    pub rooms: Arc<dyn RoomStore>,
    pub messages: Arc<dyn MessageStore>,
    pub polls: Arc<dyn PollStore>,
    pub presence: PresenceManager,
    pub scheduler: PollScheduler,
}

impl Services {
    /// Load a room the user may act in: it must be open and the user must
    /// be an active or idle participant.
    pub(crate) async fn require_member(&self, room_id: RoomId, user_id: &UserId) -> ApiResult<Room> {
        let room = self.rooms.get_room(room_id).await?;
        if !room.is_active {
            return Err(ApiError::Inactive("Room"));
        }
        if !room.is_active_participant(user_id) {
            return Err(ApiError::Forbidden("Join the room first".into()));
        }
        Ok(room)
    }

    /// Make sure the room's outbox exists before this process commits a
    /// write there, so its numbering starts below anything we will publish.
    pub(crate) async fn prime_outbox(&self, room_id: RoomId) -> ApiResult<()> {
        if !self.presence.is_primed(&room_id).await {
            let last_seq = self.rooms.last_seq(room_id).await?;
            self.presence.prime(room_id, last_seq).await;
        }
        Ok(())
    }
}

/// Routes decoded client events to the matching handler
#[derive(Clone)]
pub struct Dispatcher {
    pub rooms: RoomHandler,
    pub messages: MessageHandler,
    pub polls: PollHandler,
    presence: PresenceManager,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            presence: services.presence.clone(),
            rooms: RoomHandler::new(Arc::clone(&services)),
            messages: MessageHandler::new(Arc::clone(&services)),
            polls: PollHandler::new(services),
        }
    }

    /// Handle one event from a connection. Failures are reported to that
    /// connection only.
    pub async fn dispatch(&self, conn: &Arc<Connection>, event: ClientEvent) {
        let name = event.name();
        let actor = conn.actor();

        let result: ApiResult<()> = match event {
            ClientEvent::JoinRoom { room_id } => self.rooms.join(conn, room_id).await.map(drop),
            ClientEvent::LeaveRoom { room_id } => self.rooms.leave(conn, room_id).await,
            ClientEvent::ListRooms { unit_id, search } => {
                let filter = RoomFilter { unit_id, search };
                match self.rooms.list_rooms(&filter, Page::default()).await {
                    Ok(rooms) => {
                        self.presence.send_to(conn, ServerEvent::RoomsList { rooms }).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ClientEvent::ChangeStatus { room_id, status } => self
                .rooms
                .change_status(&actor, room_id, &status)
                .await
                .map(drop),
            ClientEvent::SetFocus { room_id, topic } => {
                self.rooms.set_focus(&actor, room_id, &topic).await.map(drop)
            }
            ClientEvent::ShareResource { room_id, resource } => self
                .rooms
                .share_resource(&actor, room_id, resource)
                .await
                .map(drop),
            ClientEvent::HighlightResource {
                room_id,
                resource_id,
                position,
            } => {
                self.rooms
                    .highlight_resource(&actor, room_id, resource_id, position)
                    .await
            }
            ClientEvent::SendMessage {
                room_id,
                content,
                parent_id,
                message_type,
                data,
            } => {
                let outgoing = OutgoingMessage {
                    content,
                    parent_id,
                    message_type,
                    data,
                };
                self.messages.send(&actor, room_id, outgoing).await.map(drop)
            }
            ClientEvent::Typing { room_id } => self.messages.typing(conn, room_id).await,
            ClientEvent::LikeMessage { message_id } => {
                self.messages.like(&actor, message_id).await.map(drop)
            }
            ClientEvent::UnlikeMessage { message_id } => {
                self.messages.unlike(&actor, message_id).await.map(drop)
            }
            ClientEvent::CreatePoll { room_id, poll_data } => {
                self.polls.create(&actor, room_id, poll_data).await.map(drop)
            }
            ClientEvent::VotePoll {
                poll_id,
                option_index,
            } => self.polls.vote(&actor, poll_id, option_index).await.map(drop),
            ClientEvent::ClosePoll { poll_id } => {
                self.polls.close(&actor, poll_id).await.map(drop)
            }
            ClientEvent::Ping => {
                self.presence.send_to(conn, ServerEvent::Pong).await;
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::debug!(
                session_id = %conn.session_id,
                user_id = %conn.user_id,
                event = name,
                error = %err,
                "Rejected client event"
            );
            self.reject(conn, &err).await;
        }
    }

    /// Report an error to the originating connection
    pub async fn reject(&self, conn: &Connection, err: &ApiError) {
        self.presence
            .send_to(
                conn,
                ServerEvent::Error {
                    message: err.client_message(),
                },
            )
            .await;
    }

    /// Greet a freshly attached connection
    pub async fn connected(&self, conn: &Connection) {
        self.presence
            .send_to(
                conn,
                ServerEvent::Connected {
                    session_id: conn.session_id,
                },
            )
            .await;
    }

    /// Tear down a connection: leave every room group and mark the user away
    /// in rooms where no other session of theirs remains.
    pub async fn disconnect(&self, conn: &Connection) {
        self.rooms.disconnect(conn).await;
    }
}
