use axum::{
    Extension,
    extract::{Json, State},
    response::IntoResponse,
};

use crate::AppState;
use crate::error::AppError;
use crate::models::UserProfile;
use crate::utils::{Claims, Identity, success_to_api_response};

use super::model::UpdateProfileRequest;

#[axum::debug_handler]
pub async fn get_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, AppError> {
    let profile = UserProfile::load(state.store.as_ref(), &Identity::from(claims)).await?;
    Ok(success_to_api_response(profile))
}

#[axum::debug_handler]
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, AppError> {
    let profile = UserProfile::update(state.store.as_ref(), &Identity::from(claims), req).await?;
    Ok(success_to_api_response(profile))
}
