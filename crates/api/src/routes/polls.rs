//! Poll routes

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use revroom_shared::{Poll, PollId, RoomId};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::handlers::PollResults;
use crate::response::ApiResponse;
use crate::state::AppState;
use crate::websocket::PollData;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    #[serde(alias = "option_index")]
    pub option_index: i64,
}

pub async fn list_room_polls(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> ApiResult<ApiResponse<Vec<Poll>>> {
    let polls = state.dispatcher.polls.active_in_room(room_id).await?;
    Ok(ApiResponse::ok(polls))
}

pub async fn create_poll(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<PollData>,
) -> ApiResult<ApiResponse<Poll>> {
    let poll = state
        .dispatcher
        .polls
        .create(&auth_user, room_id, req)
        .await?;
    Ok(ApiResponse::created(poll))
}

pub async fn vote(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(poll_id): Path<PollId>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<ApiResponse<Poll>> {
    let poll = state
        .dispatcher
        .polls
        .vote(&auth_user, poll_id, req.option_index)
        .await?;
    Ok(ApiResponse::ok(poll))
}

pub async fn close_poll(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(poll_id): Path<PollId>,
) -> ApiResult<ApiResponse<Poll>> {
    let poll = state.dispatcher.polls.close(&auth_user, poll_id).await?;
    Ok(ApiResponse::ok(poll).with_message("Poll closed"))
}

pub async fn poll_results(
    State(state): State<AppState>,
    Path(poll_id): Path<PollId>,
) -> ApiResult<ApiResponse<PollResults>> {
    let results = state.dispatcher.polls.results(poll_id).await?;
    Ok(ApiResponse::ok(results))
}
