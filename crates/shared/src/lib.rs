//! Revision Room Shared Types and Stores
//!
//! This crate contains the domain types, store traits and store backends
//! shared by the revision room API server.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use db::*;
pub use error::*;
pub use store::{MemoryStore, MessageStore, PgStore, PollStore, RoomStore};
pub use types::*;
