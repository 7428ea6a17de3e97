//! Scheduler HTTP endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::sched::model::{RecurringTask, ScheduleSpec};
use crate::state::AppState;

/// GET /v1/scheduler/stats
pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let deferred = state.deferred.stats().await;
    let recurring = state.recurring.stats().await;
    Json(serde_json::json!({
        "deferred": deferred,
        "recurring": recurring,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub user_id: String,
}

/// GET /v1/tasks?user_id=…
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> Json<serde_json::Value> {
    let recurring = state.recurring.store.for_user(&query.user_id).await;
    let deferred: Vec<_> = state
        .deferred
        .store
        .tasks
        .list()
        .await
        .into_iter()
        .filter(|t| t.user_id == query.user_id)
        .collect();
    Json(serde_json::json!({
        "recurring": recurring,
        "deferred": deferred,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateRecurring {
    pub user_id: String,
    pub name: String,
    pub prompt: String,
    pub schedule: ScheduleSpec,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// POST /v1/tasks/recurring
pub async fn create_recurring(
    State(state): State<AppState>,
    Json(body): Json<CreateRecurring>,
) -> Result<Json<RecurringTask>, (StatusCode, String)> {
    if let ScheduleSpec::Cron { expr } = &body.schedule {
        if !crate::sched::cron::is_valid(expr) {
            return Err((StatusCode::BAD_REQUEST, format!("invalid cron: {expr}")));
        }
    }
    let task = RecurringTask::new(
        body.user_id,
        body.name,
        body.prompt,
        body.schedule,
        body.timezone,
        state.config.scheduler.max_failures,
    );
    if task.next_run_at.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            "schedule never fires (bad time spec?)".into(),
        ));
    }
    let id = state.recurring.create(task).await;
    let created = state.recurring.store.tasks.get(&id).await.ok_or((
        StatusCode::INTERNAL_SERVER_ERROR,
        "task vanished after create".into(),
    ))?;
    Ok(Json(created))
}

/// DELETE /v1/tasks/recurring/:id
pub async fn cancel_recurring(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    if state.recurring.cancel(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// POST /v1/tasks/recurring/:id/pause
pub async fn pause_recurring(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.recurring.pause(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// POST /v1/tasks/recurring/:id/resume
pub async fn resume_recurring(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.recurring.resume(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
