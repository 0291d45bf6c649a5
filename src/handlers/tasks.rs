use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::errors::AppError;
use crate::middleware::CurrentUser;
use crate::models::{ListTasksQuery, StartTaskRequest, TaskResponse};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(start_task).get(list_tasks))
        .route("/:task_id", get(get_task))
        .route("/:task_id/pause", post(pause_task))
        .route("/:task_id/resume", post(resume_task))
        .route("/:task_id/cancel", post(cancel_task))
        .route("/:task_id/retry", post(retry_task))
        .route("/:task_id/continue", post(continue_task))
}

async fn start_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    payload: Result<Json<StartTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskResponse>), AppError> {
    let Json(payload) = payload?;
    payload.validate()?;

    // Both are `required` above.
    let (Some(account_id), Some(group_id)) = (payload.account_id, payload.group_id) else {
        return Err(AppError::Validation(
            "account_id and group_id are required".to_string(),
        ));
    };

    let task = state
        .engine
        .start_task(user_id, account_id, group_id, payload.interval_mode)
        .await?;
    Ok((StatusCode::CREATED, Json(state.engine.describe(task))))
}

/// Newest first, optionally filtered with `?status=`.
async fn list_tasks(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    query: Result<Query<ListTasksQuery>, QueryRejection>,
) -> Result<Json<Vec<TaskResponse>>, AppError> {
    let Query(query) = query?;
    let tasks = state.engine.list_tasks(user_id, query.status).await?;
    Ok(Json(
        tasks
            .into_iter()
            .map(|task| state.engine.describe(task))
            .collect(),
    ))
}

async fn get_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.engine.get_task(user_id, task_id).await?;
    Ok(Json(state.engine.describe(task)))
}

async fn pause_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.engine.pause_task(user_id, task_id).await?;
    Ok(Json(state.engine.describe(task)))
}

async fn resume_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.engine.resume_task(user_id, task_id).await?;
    Ok(Json(state.engine.describe(task)))
}

async fn cancel_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.engine.cancel_task(user_id, task_id).await?;
    Ok(Json(state.engine.describe(task)))
}

async fn retry_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.engine.retry_task(user_id, task_id).await?;
    Ok(Json(state.engine.describe(task)))
}

async fn continue_task(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.engine.continue_task(user_id, task_id).await?;
    Ok(Json(state.engine.describe(task)))
}
