use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::errors::AppError;
use crate::middleware::CurrentUser;
use crate::models::{ChatGroup, CreateGroupRequest, GroupTargetsRequest, UpdateGroupRequest};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_group).get(list_groups))
        .route(
            "/:group_id",
            get(get_group).patch(update_group).delete(delete_group),
        )
        .route(
            "/:group_id/targets",
            post(add_targets).delete(remove_targets),
        )
}

async fn create_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    payload: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatGroup>), AppError> {
    let Json(payload) = payload?;
    payload.validate()?;

    let group = state
        .groups
        .create(user_id, &payload.name, payload.description, &payload.links)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_groups(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<Vec<ChatGroup>>, AppError> {
    Ok(Json(state.groups.list(user_id).await?))
}

async fn get_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<ChatGroup>, AppError> {
    Ok(Json(state.groups.get(user_id, group_id).await?))
}

async fn update_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
    payload: Result<Json<UpdateGroupRequest>, JsonRejection>,
) -> Result<Json<ChatGroup>, AppError> {
    let Json(payload) = payload?;
    payload.validate()?;
    Ok(Json(state.groups.update(user_id, group_id, payload).await?))
}

/// 204 on success; 409 while an active task still references the group.
async fn delete_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.groups.delete(user_id, group_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_targets(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
    payload: Result<Json<GroupTargetsRequest>, JsonRejection>,
) -> Result<Json<ChatGroup>, AppError> {
    let Json(payload) = payload?;
    payload.validate()?;
    Ok(Json(
        state
            .groups
            .add_targets(user_id, group_id, &payload.links)
            .await?,
    ))
}

async fn remove_targets(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
    payload: Result<Json<GroupTargetsRequest>, JsonRejection>,
) -> Result<Json<ChatGroup>, AppError> {
    let Json(payload) = payload?;
    payload.validate()?;
    Ok(Json(
        state
            .groups
            .remove_targets(user_id, group_id, &payload.links)
            .await?,
    ))
}
