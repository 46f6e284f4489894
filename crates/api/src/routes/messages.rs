//! Message routes

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use revroom_shared::{Message, MessageId, RoomId};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::auth::AuthUser;
use crate::config::MAX_MESSAGE_PAGE_LIMIT;
use crate::error::{ApiError, ApiResult};
use crate::handlers::OutgoingMessage;
use crate::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct MessageHistoryQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    /// RFC 3339 cursor; only messages strictly older are returned
    #[serde(default)]
    pub before: Option<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Query(query): Query<MessageHistoryQuery>,
) -> ApiResult<ApiResponse<Vec<Message>>> {
    let limit = query
        .limit
        .unwrap_or(state.config.message_page_limit)
        .clamp(1, MAX_MESSAGE_PAGE_LIMIT);
    let before = query
        .before
        .as_deref()
        .map(|raw| {
            OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| {
                ApiError::InvalidArgument("'before' must be an RFC 3339 timestamp".into())
            })
        })
        .transpose()?;

    let messages = state
        .dispatcher
        .messages
        .recent(room_id, limit, before)
        .await?;
    Ok(ApiResponse::ok(messages))
}

pub async fn post_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<OutgoingMessage>,
) -> ApiResult<ApiResponse<Message>> {
    let message = state
        .dispatcher
        .messages
        .send(&auth_user, room_id, req)
        .await?;
    Ok(ApiResponse::created(message))
}

pub async fn list_replies(
    State(state): State<AppState>,
    Path((room_id, message_id)): Path<(RoomId, MessageId)>,
) -> ApiResult<ApiResponse<Vec<Message>>> {
    let replies = state
        .dispatcher
        .messages
        .replies(room_id, message_id)
        .await?;
    Ok(ApiResponse::ok(replies))
}

pub async fn like_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((room_id, message_id)): Path<(RoomId, MessageId)>,
) -> ApiResult<ApiResponse<Message>> {
    let message = state
        .dispatcher
        .messages
        .toggle_in_room(&auth_user, room_id, message_id, true)
        .await?;
    Ok(ApiResponse::ok(message))
}

pub async fn unlike_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((room_id, message_id)): Path<(RoomId, MessageId)>,
) -> ApiResult<ApiResponse<Message>> {
    let message = state
        .dispatcher
        .messages
        .toggle_in_room(&auth_user, room_id, message_id, false)
        .await?;
    Ok(ApiResponse::ok(message))
}
