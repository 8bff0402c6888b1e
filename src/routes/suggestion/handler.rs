use axum::{
    Extension,
    extract::State,
    response::IntoResponse,
};

use crate::AppState;
use crate::error::AppError;
use crate::utils::{Claims, Identity, success_to_api_response};

use super::model::suggestions_for;

#[axum::debug_handler]
pub async fn get_suggestions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, AppError> {
    let suggestions = suggestions_for(state.store.as_ref(), &Identity::from(claims)).await?;
    Ok(success_to_api_response(suggestions))
}
