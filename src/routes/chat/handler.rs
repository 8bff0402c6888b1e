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
use crate::models::{ChatMessage, GroupKind};
use crate::routes::group::{Changed, load_group, require_member};
use crate::routes::subscription::{Loader, snapshot_sse};
use crate::store::Collection;
use crate::utils::{Claims, Identity, success_to_api_response};

use super::model::{ModerateRequest, PostMessageRequest, ReportMessageRequest};

const CHAT_COLLECTIONS: &[Collection] = &[Collection::Members, Collection::Messages];

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub message_id: String,
}

#[axum::debug_handler]
pub async fn post_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let message = ChatMessage::post(state.store.as_ref(), &Identity::from(claims), req).await?;
    Ok((StatusCode::CREATED, success_to_api_response(message)))
}

#[axum::debug_handler]
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<EventQuery>,
) -> Result<impl IntoResponse, AppError> {
    let messages =
        ChatMessage::list(state.store.as_ref(), &query.event_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(messages))
}

#[axum::debug_handler]
pub async fn stream_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<EventQuery>,
) -> Result<impl IntoResponse, AppError> {
    let event = load_group(state.store.as_ref(), &query.event_id).await?;
    if event.kind != GroupKind::Event {
        return Err(AppError::NotFound("event"));
    }
    require_member(state.store.as_ref(), &event, &claims.sub).await?;

    // every snapshot goes through the same membership check as a plain read
    let store = state.store.clone();
    let reader = Identity::from(claims);
    let event_id = query.event_id.clone();
    let load: Loader<Vec<ChatMessage>> = Arc::new(move || {
        let store = store.clone();
        let reader = reader.clone();
        let event_id = event_id.clone();
        async move { ChatMessage::list(store.as_ref(), &event_id, &reader).await }.boxed()
    });
    Ok(snapshot_sse(&state.store, query.event_id, CHAT_COLLECTIONS, load))
}

#[axum::debug_handler]
pub async fn report_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReportMessageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let reporter = Identity::from(claims);
    let message = ChatMessage::report(state.store.as_ref(), &reporter, req).await?;
    // the reporter only learns the outcome, not who else reported
    Ok(success_to_api_response(serde_json::json!({
        "message_id": message.message_id,
        "status": message.status,
    })))
}

#[axum::debug_handler]
pub async fn moderate_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ModerateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let message = ChatMessage::moderate(state.store.as_ref(), &Identity::from(claims), req).await?;
    Ok(success_to_api_response(message))
}

#[axum::debug_handler]
pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MessageBody>,
) -> Result<impl IntoResponse, AppError> {
    ChatMessage::delete(state.store.as_ref(), &req.message_id, &Identity::from(claims)).await?;
    Ok(success_to_api_response(Changed { changed: true }))
}
