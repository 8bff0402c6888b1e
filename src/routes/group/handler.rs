use axum::{
    Extension,
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::models::{Group, GroupKind, RequestStatus};
use crate::utils::{Claims, Identity, success_to_api_response};

use super::model::{
    CreateGroupRequest, JoinGroupRequest, MemberTarget, RespondRequest, SetRoleRequest,
    UpdateGroupRequest,
};

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub group_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MineQuery {
    pub kind: Option<GroupKind>,
}

#[derive(Debug, Deserialize)]
pub struct RequestsQuery {
    pub group_id: String,
    pub status: Option<RequestStatus>,
}

#[derive(Debug, Deserialize)]
pub struct IdBody {
    pub group_id: String,
}

#[derive(Debug, Serialize)]
pub struct Changed {
    pub changed: bool,
}

#[axum::debug_handler]
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    let group = Group::create(state.store.as_ref(), &Identity::from(claims), req).await?;
    Ok((StatusCode::CREATED, success_to_api_response(group)))
}

#[axum::debug_handler]
pub async fn find_by_id(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<IdQuery>,
) -> Result<impl IntoResponse, AppError> {
    let info = Group::info(state.store.as_ref(), &query.group_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(info))
}

#[axum::debug_handler]
pub async fn my_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MineQuery>,
) -> Result<impl IntoResponse, AppError> {
    let groups = Group::list_mine(state.store.as_ref(), &Identity::from(claims), query.kind).await?;
    Ok(success_to_api_response(groups))
}

#[axum::debug_handler]
pub async fn update_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    let group = Group::update(state.store.as_ref(), &Identity::from(claims), req).await?;
    Ok(success_to_api_response(group))
}

#[axum::debug_handler]
pub async fn delete_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<IdBody>,
) -> Result<impl IntoResponse, AppError> {
    Group::delete(state.store.as_ref(), &Identity::from(claims), &req.group_id).await?;
    Ok(success_to_api_response(Changed { changed: true }))
}

#[axum::debug_handler]
pub async fn join_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<JoinGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = Group::request_to_join(
        state.store.as_ref(),
        &state.notifier,
        &req.group_id,
        &Identity::from(claims),
        req.answers,
    )
    .await?;
    Ok(success_to_api_response(outcome))
}

#[axum::debug_handler]
pub async fn leave_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<IdBody>,
) -> Result<impl IntoResponse, AppError> {
    let changed = Group::leave(state.store.as_ref(), &req.group_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(Changed { changed }))
}

#[axum::debug_handler]
pub async fn cancel_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<IdBody>,
) -> Result<impl IntoResponse, AppError> {
    let changed =
        Group::cancel_request(state.store.as_ref(), &req.group_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(Changed { changed }))
}

#[axum::debug_handler]
pub async fn list_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<RequestsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let requests = Group::requests(
        state.store.as_ref(),
        &query.group_id,
        &Identity::from(claims),
        query.status,
    )
    .await?;
    Ok(success_to_api_response(requests))
}

#[axum::debug_handler]
pub async fn respond_to_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RespondRequest>,
) -> Result<impl IntoResponse, AppError> {
    let request = Group::respond_to_request(
        state.store.as_ref(),
        &req.request_id,
        req.decision,
        &Identity::from(claims),
        req.reason,
    )
    .await?;
    Ok(success_to_api_response(request))
}

#[axum::debug_handler]
pub async fn get_group_members(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<IdQuery>,
) -> Result<impl IntoResponse, AppError> {
    let members =
        Group::members(state.store.as_ref(), &query.group_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(members))
}

#[axum::debug_handler]
pub async fn remove_group_member(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MemberTarget>,
) -> Result<impl IntoResponse, AppError> {
    Group::remove_member(state.store.as_ref(), &Identity::from(claims), &req).await?;
    Ok(success_to_api_response(Changed { changed: true }))
}

#[axum::debug_handler]
pub async fn set_member_role(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    Group::set_role(state.store.as_ref(), &Identity::from(claims), &req).await?;
    Ok(success_to_api_response(Changed { changed: true }))
}
