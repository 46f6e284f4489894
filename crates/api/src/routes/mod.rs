//! API routes

pub mod health;
pub mod messages;
pub mod polls;
pub mod rooms;

#[cfg(test)]
mod router_tests;

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{auth::require_auth, state::AppState, websocket::ws_handler};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let protected_api_routes = Router::new()
        // Rooms
        .route("/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route(
            "/rooms/:id",
            get(rooms::get_room)
                .put(rooms::update_room)
                .delete(rooms::close_room),
        )
        .route("/rooms/:id/participants", get(rooms::list_participants))
        .route(
            "/rooms/:id/resources",
            get(rooms::list_resources).post(rooms::add_resource),
        )
        // Messages
        .route(
            "/rooms/:id/messages",
            get(messages::list_messages).post(messages::post_message),
        )
        .route(
            "/rooms/:id/messages/:msg_id/replies",
            get(messages::list_replies),
        )
        .route(
            "/rooms/:id/messages/:msg_id/like",
            post(messages::like_message).delete(messages::unlike_message),
        )
        // Polls
        .route(
            "/polls/room/:id",
            get(polls::list_room_polls).post(polls::create_poll),
        )
        .route("/polls/:id/vote", post(polls::vote))
        .route("/polls/:id/close", post(polls::close_poll))
        .route("/polls/:id/results", get(polls::poll_results))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // WebSocket authenticates during the upgrade
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/api/v1", protected_api_routes)
        .layer(cors_layer(&state.config.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}
