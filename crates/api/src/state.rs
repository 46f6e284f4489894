//! Application state shared by every route and socket

use std::sync::Arc;

use revroom_shared::{MemoryStore, MessageStore, PgStore, PollStore, RoomStore};
use sqlx::PgPool;

use crate::auth::JwtManager;
use crate::config::Config;
use crate::handlers::{Dispatcher, Services};
use crate::poll_expiry::PollScheduler;
use crate::websocket::PresenceManager;

/// The three stores, usually backed by one implementation
#[derive(Clone)]
pub struct Stores {
    pub rooms: Arc<dyn RoomStore>,
    pub messages: Arc<dyn MessageStore>,
    pub polls: Arc<dyn PollStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            rooms: store.clone(),
            messages: store.clone(),
            polls: store,
        }
    }

    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            rooms: store.clone(),
            messages: store.clone(),
            polls: store,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    pub presence: PresenceManager,
    pub dispatcher: Dispatcher,
    pub scheduler: PollScheduler,
    /// Present when running against Postgres; used by readiness checks
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(config: Config, stores: Stores, pool: Option<PgPool>) -> Self {
        let presence = PresenceManager::new(config.ws_send_buffer);
        let scheduler = PollScheduler::new(stores.rooms.clone(), stores.polls.clone(), presence.clone());
        let services = Arc::new(Services {
            rooms: stores.rooms,
            messages: stores.messages,
            polls: stores.polls,
            presence: presence.clone(),
            scheduler: scheduler.clone(),
        });

        Self {
            jwt: JwtManager::new(&config.jwt_secret),
            config: Arc::new(config),
            presence,
            dispatcher: Dispatcher::new(services),
            scheduler,
            pool,
        }
    }
}
