//! Room membership, status, focus and resources

use std::sync::Arc;

use revroom_shared::{
    NewResource, NewRoom, Page, Participant, ParticipantStatus, Resource, Room, RoomFilter,
    RoomId, RoomUpdate, UserId,
};

use super::Services;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::websocket::{Connection, Fanout, ServerEvent};

#[derive(Clone)]
pub struct RoomHandler {
    svc: Arc<Services>,
}

impl RoomHandler {
    pub fn new(svc: Arc<Services>) -> Self {
        Self { svc }
    }

    /// Join a room: record participation, subscribe the connection, send the
    /// joiner a snapshot, then tell the others. Joining twice is harmless.
    ///
    /// Room events committed after the join are held until its own event is
    /// published, so the joiner sees them after the snapshot.
    pub async fn join(&self, conn: &Arc<Connection>, room_id: RoomId) -> ApiResult<Room> {
        let room = self.svc.rooms.get_room(room_id).await?;
        if !room.is_active {
            return Err(ApiError::Inactive("Room"));
        }
        let active_polls = self.svc.polls.get_active_polls(room_id).await?;
        self.svc.prime_outbox(room_id).await?;

        let committed = self
            .svc
            .rooms
            .add_or_update_participant(room_id, conn.user_id, &conn.display_name)
            .await?;
        let room = committed.value;
        self.svc.presence.subscribe(conn, room_id).await;
        self.svc
            .presence
            .send_to(
                conn,
                ServerEvent::RoomJoined {
                    room: room.clone(),
                    active_polls,
                },
            )
            .await;

        let batch = room
            .participant(&conn.user_id)
            .cloned()
            .map(|participant| {
                Fanout::except(
                    conn.session_id,
                    ServerEvent::UserJoined {
                        room_id,
                        participant,
                        participant_count: present_count(&room.participants),
                    },
                )
            })
            .into_iter()
            .collect();
        self.svc.presence.publish(room_id, committed.seq, batch).await;

        tracing::info!(
            room_id = %room_id,
            user_id = %conn.user_id,
            session_id = %conn.session_id,
            "User joined room"
        );
        Ok(room)
    }

    /// Leave a room on this connection. The participant is only marked away
    /// once none of the user's sessions remain in the room.
    pub async fn leave(&self, conn: &Connection, room_id: RoomId) -> ApiResult<()> {
        self.svc.presence.unsubscribe(conn, room_id).await;
        if self.svc.presence.is_user_in_room(&room_id, &conn.user_id).await {
            return Ok(());
        }
        self.mark_away(room_id, conn.user_id, &conn.display_name).await
    }

    /// Cleanup after a socket closes
    pub async fn disconnect(&self, conn: &Connection) {
        let rooms = self.svc.presence.detach(&conn.session_id).await;
        for room_id in rooms {
            if self.svc.presence.is_user_in_room(&room_id, &conn.user_id).await {
                continue;
            }
            if let Err(e) = self
                .mark_away(room_id, conn.user_id, &conn.display_name)
                .await
            {
                tracing::warn!(
                    room_id = %room_id,
                    user_id = %conn.user_id,
                    error = %e,
                    "Failed to mark participant away on disconnect"
                );
            }
        }
    }

    async fn mark_away(&self, room_id: RoomId, user_id: UserId, display_name: &str) -> ApiResult<()> {
        self.svc.prime_outbox(room_id).await?;
        let committed = self
            .svc
            .rooms
            .set_participant_status(room_id, user_id, ParticipantStatus::Away)
            .await?;
        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::UserLeft {
                    room_id,
                    user_id,
                    display_name: display_name.to_string(),
                })],
            )
            .await;
        tracing::info!(room_id = %room_id, user_id = %user_id, "User left room");
        Ok(())
    }

    pub async fn list_rooms(&self, filter: &RoomFilter, page: Page) -> ApiResult<Vec<Room>> {
        Ok(self.svc.rooms.list_active_rooms(filter, page).await?)
    }

    pub async fn get_room(&self, room_id: RoomId) -> ApiResult<Room> {
        Ok(self.svc.rooms.get_room(room_id).await?)
    }

    pub async fn create_room(&self, actor: &AuthUser, new: NewRoom) -> ApiResult<Room> {
        let room = self
            .svc
            .rooms
            .create_room(new, actor.user_id, &actor.display_name)
            .await?;
        tracing::info!(room_id = %room.id, created_by = %actor.user_id, "Room created");
        Ok(room)
    }

    /// Creator-only metadata update. A changed focus is broadcast.
    pub async fn update_room(
        &self,
        actor: &AuthUser,
        room_id: RoomId,
        update: RoomUpdate,
    ) -> ApiResult<Room> {
        let before = self.svc.rooms.get_room(room_id).await?;
        self.svc.prime_outbox(room_id).await?;
        let committed = self
            .svc
            .rooms
            .update_room(room_id, actor.user_id, update)
            .await?;
        let room = committed.value;

        let mut batch = Vec::new();
        if room.current_focus != before.current_focus {
            batch.push(Fanout::all(ServerEvent::FocusChanged {
                room_id,
                topic: room.current_focus.clone(),
                changed_by: actor.user_id,
            }));
        }
        self.svc.presence.publish(room_id, committed.seq, batch).await;
        Ok(room)
    }

    /// Creator-only close
    pub async fn close_room(&self, actor: &AuthUser, room_id: RoomId) -> ApiResult<Room> {
        self.svc.prime_outbox(room_id).await?;
        let committed = self.svc.rooms.close_room(room_id, actor.user_id).await?;
        let closed = committed.value;

        let mut batch = Vec::new();
        if closed.transitioned {
            batch.push(Fanout::all(ServerEvent::RoomClosed { room_id }));
        }
        self.svc.presence.publish(room_id, committed.seq, batch).await;

        if closed.transitioned {
            tracing::info!(room_id = %room_id, closed_by = %actor.user_id, "Room closed");
        }
        Ok(closed.room)
    }

    /// Members only. An `away` participant has to rejoin first.
    pub async fn change_status(
        &self,
        actor: &AuthUser,
        room_id: RoomId,
        status: &str,
    ) -> ApiResult<Room> {
        let status: ParticipantStatus = status.parse()?;
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;

        let committed = self
            .svc
            .rooms
            .set_participant_status(room_id, actor.user_id, status)
            .await?;
        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::StatusChanged {
                    room_id,
                    user_id: actor.user_id,
                    status,
                })],
            )
            .await;
        Ok(committed.value)
    }

    pub async fn set_focus(&self, actor: &AuthUser, room_id: RoomId, topic: &str) -> ApiResult<Room> {
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;
        let committed = self.svc.rooms.set_focus(room_id, topic).await?;
        let room = committed.value;

        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::FocusChanged {
                    room_id,
                    topic: room.current_focus.clone(),
                    changed_by: actor.user_id,
                })],
            )
            .await;
        Ok(room)
    }

    pub async fn share_resource(
        &self,
        actor: &AuthUser,
        room_id: RoomId,
        resource: NewResource,
    ) -> ApiResult<Resource> {
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;
        let committed = self
            .svc
            .rooms
            .add_resource(room_id, actor.user_id, resource)
            .await?;
        let resource = committed.value;

        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::ResourceShared {
                    room_id,
                    resource: resource.clone(),
                })],
            )
            .await;
        tracing::debug!(room_id = %room_id, resource_id = %resource.id, "Resource shared");
        Ok(resource)
    }

    /// Point everyone at a part of a shared resource. Nothing is stored.
    pub async fn highlight_resource(
        &self,
        actor: &AuthUser,
        room_id: RoomId,
        resource_id: String,
        position: serde_json::Value,
    ) -> ApiResult<()> {
        let room = self.svc.require_member(room_id, &actor.user_id).await?;
        let known = room.resources.iter().any(|r| {
            r.id.to_string() == resource_id || r.reference_id.as_deref() == Some(resource_id.as_str())
        });
        if !known {
            return Err(ApiError::NotFound("Resource"));
        }

        self.svc
            .presence
            .broadcast(
                room_id,
                ServerEvent::ResourceHighlighted {
                    room_id,
                    resource_id,
                    position,
                    highlighted_by: actor.user_id,
                },
            )
            .await;
        Ok(())
    }
}

/// Participants currently in the room
fn present_count(participants: &[Participant]) -> usize {
    participants
        .iter()
        .filter(|p| p.status != ParticipantStatus::Away)
        .count()
}
