//! WebSocket gateway for Axum
//!
//! Authenticates the upgrade request, then runs one read loop per socket.
//! Events from a socket are handled strictly in arrival order.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{bearer_token, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

use super::{connection::Connection, events::ClientEvent};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

/// Upgrade to a WebSocket once the caller's identity is established.
/// The token comes from `?token=` or the `Authorization` header.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| {
            tracing::warn!("WebSocket auth failed: no token");
            StatusCode::UNAUTHORIZED
        })?;

    let user = AuthUser::from_token(&app_state.jwt, token).map_err(|e| {
        tracing::warn!(error = %e, "WebSocket auth failed: invalid token");
        StatusCode::UNAUTHORIZED
    })?;

    tracing::info!(user_id = %user.user_id, "WebSocket connection upgrade requested");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user, app_state)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, user: AuthUser, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (conn, mut rx) = app_state
        .presence
        .attach_identity(user.user_id, user.display_name)
        .await;
    let session_id = conn.session_id;
    let dispatcher = app_state.dispatcher.clone();

    dispatcher.connected(&conn).await;

    // Writer: drain the bounded queue into the socket
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, event = event.name(), "Failed to serialize WebSocket event");
                }
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = conn.evicted() => {
                tracing::info!(session_id = %session_id, "Closing evicted WebSocket connection");
                break;
            }
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else {
                    break;
                };
                match msg {
                    Message::Text(text) => handle_text(&dispatcher, &conn, &text).await,
                    Message::Close(_) => {
                        tracing::info!(session_id = %session_id, "WebSocket close frame received");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        // Axum handles ping/pong automatically
                    }
                    Message::Binary(_) => {
                        dispatcher
                            .reject(&conn, &ApiError::InvalidArgument("Invalid event format".into()))
                            .await;
                    }
                }
            }
        }
    }

    tracing::info!(session_id = %session_id, user_id = %conn.user_id, "WebSocket connection closing");
    dispatcher.disconnect(&conn).await;

    send_task.abort();
}

async fn handle_text(dispatcher: &crate::handlers::Dispatcher, conn: &Arc<Connection>, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => dispatcher.dispatch(conn, event).await,
        Err(e) => {
            tracing::warn!(
                session_id = %conn.session_id,
                error = %e,
                "Failed to parse client event"
            );
            dispatcher
                .reject(conn, &ApiError::InvalidArgument("Invalid event format".into()))
                .await;
        }
    }
}
