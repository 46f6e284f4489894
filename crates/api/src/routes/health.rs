//! Health and readiness endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::config::StoreBackend;
use crate::state::AppState;
use crate::websocket::PresenceStats;

#[derive(Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub version: &'static str,
    pub backend: &'static str,
    pub realtime: PresenceStats,
    pub pending_poll_timers: usize,
}

/// The memory backend is always reachable
async fn store_reachable(state: &AppState) -> bool {
    match &state.pool {
        Some(pool) => revroom_shared::ping(pool).await,
        None => true,
    }
}

/// Store reachability plus live connection counts
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let healthy = store_reachable(&state).await;
    let report = HealthReport {
        healthy,
        version: env!("CARGO_PKG_VERSION"),
        backend: match state.config.store_backend {
            StoreBackend::Postgres => "postgres",
            StoreBackend::Memory => "memory",
        },
        realtime: state.presence.get_stats().await,
        pending_poll_timers: state.scheduler.pending(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if store_reachable(&state).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
