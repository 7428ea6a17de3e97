//! Thin HTTP surface: the device WebSocket door plus scheduler endpoints.

pub mod schedules;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::devices::ws::device_ws;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/devices/ws", get(device_ws))
        .route("/v1/scheduler/stats", get(schedules::stats))
        .route("/v1/tasks", get(schedules::list_tasks))
        .route("/v1/tasks/recurring", post(schedules::create_recurring))
        .route("/v1/tasks/recurring/:id", delete(schedules::cancel_recurring))
        .route("/v1/tasks/recurring/:id/pause", post(schedules::pause_recurring))
        .route("/v1/tasks/recurring/:id/resume", post(schedules::resume_recurring))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
