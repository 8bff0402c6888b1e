use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde::Deserialize;

use crate::{
    AppState,
    error::AppError,
    utils::{Claims, verify_token},
};

/// Verifies the bearer token and exposes its claims to handlers.
pub async fn auth_middleware(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let claims = authenticate(&state, bearer)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Admin routes re-check the caller with the identity provider and require
/// an allow-listed email.
pub async fn admin_middleware(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer
        .as_ref()
        .map(|TypedHeader(Authorization(b))| b.token().to_string());
    let claims = authenticate(&state, bearer)?;

    let email = match (&state.config.identity_lookup_url, token) {
        (Some(url), Some(token)) => lookup_email(&state.http, url, &token, &claims.sub).await?,
        _ => claims.email.clone(),
    };
    if !state.config.is_admin_email(&email) {
        tracing::warn!("Rejected admin call from {}", claims.sub);
        return Err(AppError::PermissionDenied("admin access required"));
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

fn authenticate(
    state: &AppState,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Claims, AppError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(AppError::Unauthorized)?;
    verify_token(bearer.token(), &state.config).map_err(|e| {
        tracing::debug!("Token rejected: {}", e);
        AppError::Unauthorized
    })
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    email: Option<String>,
}

async fn lookup_email(
    http: &reqwest::Client,
    url: &str,
    token: &str,
    expected_uid: &str,
) -> Result<String, AppError> {
    let response = http
        .post(url)
        .json(&serde_json::json!({ "idToken": token }))
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| {
            tracing::warn!("Identity lookup failed: {}", e);
            AppError::Unauthorized
        })?;
    let body: LookupResponse = response.json().await.map_err(|e| {
        tracing::warn!("Identity lookup returned an unexpected body: {}", e);
        AppError::Unauthorized
    })?;

    body.users
        .into_iter()
        .find(|u| u.local_id == expected_uid)
        .and_then(|u| u.email)
        .ok_or(AppError::Unauthorized)
}
