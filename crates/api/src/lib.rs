//! Revision Room API Library
//!
//! Real-time collaboration server for revision rooms: presence, chat,
//! shared resources and live polls over WebSocket, with a thin HTTP API.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod poll_expiry;
pub mod response;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::{AppState, Stores};
