use std::sync::Arc;

use axum::{
    Extension,
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::FutureExt;
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::models::{Comment, Post, PostView};
use crate::routes::group::{Changed, load_group, require_reader};
use crate::routes::subscription::{Loader, snapshot_sse};
use crate::store::Collection;
use crate::utils::{Claims, Identity, success_to_api_response};

use super::model::{CreateCommentRequest, CreatePostRequest, ReactRequest};

const FEED_COLLECTIONS: &[Collection] = &[
    Collection::Members,
    Collection::Posts,
    Collection::Reactions,
    Collection::Comments,
];

#[derive(Debug, Deserialize)]
pub struct GroupQuery {
    pub group_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PostQuery {
    pub post_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PostBody {
    pub post_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentBody {
    pub comment_id: String,
}

#[axum::debug_handler]
pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, AppError> {
    let post = Post::create(
        state.store.as_ref(),
        &state.notifier,
        &Identity::from(claims),
        req,
    )
    .await?;
    Ok((StatusCode::CREATED, success_to_api_response(post)))
}

#[axum::debug_handler]
pub async fn get_feed(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<GroupQuery>,
) -> Result<impl IntoResponse, AppError> {
    let feed = Post::feed(state.store.as_ref(), &query.group_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(feed))
}

/// Access is checked when the stream opens and again for every snapshot,
/// so a reader who loses access stops receiving posts.
#[axum::debug_handler]
pub async fn stream_feed(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<GroupQuery>,
) -> Result<impl IntoResponse, AppError> {
    let reader = Identity::from(claims);
    let group = load_group(state.store.as_ref(), &query.group_id).await?;
    require_reader(state.store.as_ref(), &group, &reader.uid).await?;

    let store = state.store.clone();
    let group_id = query.group_id.clone();
    let load: Loader<Vec<PostView>> = Arc::new(move || {
        let store = store.clone();
        let group_id = group_id.clone();
        let reader = reader.clone();
        async move { Post::feed(store.as_ref(), &group_id, &reader).await }.boxed()
    });
    Ok(snapshot_sse(&state.store, query.group_id, FEED_COLLECTIONS, load))
}

#[axum::debug_handler]
pub async fn react(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactRequest>,
) -> Result<impl IntoResponse, AppError> {
    let view = Post::toggle_reaction(
        state.store.as_ref(),
        &req.post_id,
        &Identity::from(claims),
        req.kind,
    )
    .await?;
    Ok(success_to_api_response(view))
}

#[axum::debug_handler]
pub async fn pin_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostBody>,
) -> Result<impl IntoResponse, AppError> {
    let view = Post::set_pinned(state.store.as_ref(), &req.post_id, &Identity::from(claims), true)
        .await?;
    Ok(success_to_api_response(view))
}

#[axum::debug_handler]
pub async fn unpin_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostBody>,
) -> Result<impl IntoResponse, AppError> {
    let view = Post::set_pinned(state.store.as_ref(), &req.post_id, &Identity::from(claims), false)
        .await?;
    Ok(success_to_api_response(view))
}

#[axum::debug_handler]
pub async fn delete_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostBody>,
) -> Result<impl IntoResponse, AppError> {
    Post::delete(state.store.as_ref(), &req.post_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(Changed { changed: true }))
}

#[axum::debug_handler]
pub async fn add_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let comment = Comment::create(state.store.as_ref(), &Identity::from(claims), req).await?;
    Ok((StatusCode::CREATED, success_to_api_response(comment)))
}

#[axum::debug_handler]
pub async fn list_comments(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PostQuery>,
) -> Result<impl IntoResponse, AppError> {
    let comments =
        Comment::list(state.store.as_ref(), &query.post_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(comments))
}

#[axum::debug_handler]
pub async fn delete_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CommentBody>,
) -> Result<impl IntoResponse, AppError> {
    Comment::delete(state.store.as_ref(), &req.comment_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(Changed { changed: true }))
}
