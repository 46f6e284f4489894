//! Chat messages, replies, typing and likes

use std::sync::Arc;

use revroom_shared::{Message, MessageId, MessageType, NewMessage, RoomId};
use serde::Deserialize;
use time::OffsetDateTime;

use super::Services;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::websocket::{Connection, Fanout, ServerEvent};

/// A message as submitted by a client
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "parent_id")]
    pub parent_id: Option<MessageId>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct MessageHandler {
    svc: Arc<Services>,
}

impl MessageHandler {
    pub fn new(svc: Arc<Services>) -> Self {
        Self { svc }
    }

    pub async fn send(
        &self,
        actor: &AuthUser,
        room_id: RoomId,
        outgoing: OutgoingMessage,
    ) -> ApiResult<Message> {
        if outgoing.content.trim().is_empty() {
            return Err(ApiError::Validation("Message content cannot be empty".into()));
        }
        let message_type = client_message_type(outgoing.message_type.as_deref())?;
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;

        let committed = self
            .svc
            .messages
            .post_message(NewMessage {
                room_id,
                author_id: actor.user_id,
                author_name: actor.display_name.clone(),
                content: outgoing.content,
                message_type,
                parent_id: outgoing.parent_id,
                payload: outgoing.data,
            })
            .await?;
        let message = committed.value;

        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::NewMessage {
                    room_id,
                    message: message.clone(),
                })],
            )
            .await;

        tracing::debug!(
            room_id = %room_id,
            message_id = %message.id,
            author_id = %actor.user_id,
            "Message posted"
        );
        Ok(message)
    }

    /// Ephemeral indicator relayed to everyone else in the room
    pub async fn typing(&self, conn: &Connection, room_id: RoomId) -> ApiResult<()> {
        self.svc.require_member(room_id, &conn.user_id).await?;
        self.svc
            .presence
            .broadcast_except(
                room_id,
                conn.session_id,
                ServerEvent::UserTyping {
                    room_id,
                    user_id: conn.user_id,
                    display_name: conn.display_name.clone(),
                },
            )
            .await;
        Ok(())
    }

    pub async fn like(&self, actor: &AuthUser, message_id: MessageId) -> ApiResult<Message> {
        let room_id = self.svc.messages.get_message(message_id).await?.room_id;
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;

        let committed = self.svc.messages.like(message_id, actor.user_id).await?;
        let message = committed.value;
        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::MessageLiked {
                    room_id,
                    message_id,
                    user_id: actor.user_id,
                    like_count: message.like_count,
                })],
            )
            .await;
        Ok(message)
    }

    pub async fn unlike(&self, actor: &AuthUser, message_id: MessageId) -> ApiResult<Message> {
        let room_id = self.svc.messages.get_message(message_id).await?.room_id;
        self.svc.require_member(room_id, &actor.user_id).await?;
        self.svc.prime_outbox(room_id).await?;

        let committed = self.svc.messages.unlike(message_id, actor.user_id).await?;
        let message = committed.value;
        self.svc
            .presence
            .publish(
                room_id,
                committed.seq,
                vec![Fanout::all(ServerEvent::MessageUnliked {
                    room_id,
                    message_id,
                    user_id: actor.user_id,
                    like_count: message.like_count,
                })],
            )
            .await;
        Ok(message)
    }

    /// Newest-first history page
    pub async fn recent(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<OffsetDateTime>,
    ) -> ApiResult<Vec<Message>> {
        self.svc.rooms.get_room(room_id).await?;
        Ok(self.svc.messages.list_recent(room_id, limit, before).await?)
    }

    /// Replies to a message that must belong to `room_id`
    pub async fn replies(&self, room_id: RoomId, parent_id: MessageId) -> ApiResult<Vec<Message>> {
        let parent = self.svc.messages.get_message(parent_id).await?;
        if parent.room_id != room_id {
            return Err(ApiError::NotFound("Message"));
        }
        Ok(self.svc.messages.list_replies(parent_id).await?)
    }

    /// Like or unlike a message that must belong to `room_id`
    pub async fn toggle_in_room(
        &self,
        actor: &AuthUser,
        room_id: RoomId,
        message_id: MessageId,
        liked: bool,
    ) -> ApiResult<Message> {
        let message = self.svc.messages.get_message(message_id).await?;
        if message.room_id != room_id {
            return Err(ApiError::NotFound("Message"));
        }
        if liked {
            self.like(actor, message_id).await
        } else {
            self.unlike(actor, message_id).await
        }
    }
}

/// Poll announcements and system notices are produced by the server only
fn client_message_type(requested: Option<&str>) -> ApiResult<MessageType> {
    let Some(raw) = requested else {
        return Ok(MessageType::Text);
    };
    let message_type: MessageType = raw.parse()?;
    match message_type {
        MessageType::Poll | MessageType::System => Err(ApiError::InvalidArgument(format!(
            "Message type '{raw}' cannot be sent by clients"
        ))),
        other => Ok(other),
    }
}
