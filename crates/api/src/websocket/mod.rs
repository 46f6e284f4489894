//! WebSocket support for revision rooms
//!
//! - **Connection**: an authenticated socket with a bounded outbound queue
//! - **Room**: per-room subscriber groups used for fan-out
//! - **State**: the [`PresenceManager`] registry shared by all sockets
//! - **Outbox**: per-room release of committed events in sequence order
//! - **Handler**: the Axum upgrade route and per-socket read loop
//! - **Events**: typed client and server events

pub mod connection;
pub mod events;
pub mod handler;
pub mod outbox;
pub mod room;
pub mod state;

pub use connection::Connection;
pub use events::{ClientEvent, PollData, ServerEvent};
pub use handler::ws_handler;
pub use outbox::Fanout;
pub use state::{PresenceManager, PresenceStats};
