//! Room routes

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use revroom_shared::{
    NewResource, NewRoom, Page, Participant, Resource, Room, RoomFilter, RoomId, RoomUpdate,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RoomListQuery {
    #[serde(default, alias = "unitId")]
    pub unit_id: Option<Uuid>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl RoomListQuery {
    fn split(self) -> (RoomFilter, Page) {
        let defaults = Page::default();
        let page = Page {
            page: self.page.unwrap_or(defaults.page),
            limit: self.limit.unwrap_or(defaults.limit),
        };
        (
            RoomFilter {
                unit_id: self.unit_id,
                search: self.search,
            },
            page,
        )
    }
}

/// List active rooms
pub async fn list_rooms(
    State(state): State<AppState>,
    Query(query): Query<RoomListQuery>,
) -> ApiResult<ApiResponse<Vec<Room>>> {
    let (filter, page) = query.split();
    let rooms = state.dispatcher.rooms.list_rooms(&filter, page).await?;
    Ok(ApiResponse::ok(rooms))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> ApiResult<ApiResponse<Room>> {
    let room = state.dispatcher.rooms.get_room(room_id).await?;
    Ok(ApiResponse::ok(room))
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<NewRoom>,
) -> ApiResult<ApiResponse<Room>> {
    let room = state.dispatcher.rooms.create_room(&auth_user, req).await?;
    Ok(ApiResponse::created(room))
}

pub async fn update_room(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<RoomUpdate>,
) -> ApiResult<ApiResponse<Room>> {
    let room = state
        .dispatcher
        .rooms
        .update_room(&auth_user, room_id, req)
        .await?;
    Ok(ApiResponse::ok(room))
}

/// Close a room (creator only)
pub async fn close_room(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(room_id): Path<RoomId>,
) -> ApiResult<ApiResponse<Room>> {
    let room = state.dispatcher.rooms.close_room(&auth_user, room_id).await?;
    Ok(ApiResponse::ok(room).with_message("Room closed"))
}

pub async fn list_participants(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> ApiResult<ApiResponse<Vec<Participant>>> {
    let room = state.dispatcher.rooms.get_room(room_id).await?;
    Ok(ApiResponse::ok(room.participants))
}

pub async fn list_resources(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> ApiResult<ApiResponse<Vec<Resource>>> {
    let room = state.dispatcher.rooms.get_room(room_id).await?;
    Ok(ApiResponse::ok(room.resources))
}

pub async fn add_resource(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<NewResource>,
) -> ApiResult<ApiResponse<Resource>> {
    let resource = state
        .dispatcher
        .rooms
        .share_resource(&auth_user, room_id, req)
        .await?;
    Ok(ApiResponse::created(resource))
}
