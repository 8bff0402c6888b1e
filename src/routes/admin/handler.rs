use axum::{Extension, extract::State, response::IntoResponse};

use crate::AppState;
use crate::error::AppError;
use crate::utils::{Claims, success_to_api_response};

/// Recomputes denormalized counters and purges orphaned records. Safe to
/// call repeatedly.
#[axum::debug_handler]
pub async fn reconcile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, AppError> {
    let report = state.store.reconcile().await?;
    tracing::info!(
        "Reconcile by {}: {} groups checked, {} member counts fixed, {} comment counts fixed, {} orphans removed",
        claims.sub,
        report.groups_checked,
        report.member_counts_fixed,
        report.comment_counts_fixed,
        report.orphans_removed
    );
    Ok(success_to_api_response(report))
}
