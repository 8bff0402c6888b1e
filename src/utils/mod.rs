use axum::Json;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // uid
    pub name: String,
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

/// The authenticated caller, passed explicitly into every workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub display_name: String,
    pub email: String,
}

impl Identity {
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Self {
        let uid = uid.into();
        Self {
            email: format!("{}@users.smaaks.local", uid),
            uid,
            display_name: display_name.into(),
        }
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            uid: claims.sub,
            display_name: claims.name,
            email: claims.email,
        }
    }
}

pub fn generate_token(
    identity: &Identity,
    config: &Config,
) -> Result<(String, i64), jsonwebtoken::errors::Error> {
    let expiration = (Utc::now()
        + Duration::seconds(config.jwt_expiration().as_secs() as i64))
    .timestamp();

    let claims = Claims {
        sub: identity.uid.clone(),
        name: identity.display_name.clone(),
        email: identity.email.clone(),
        exp: expiration,
        iat: Utc::now().timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )?;

    Ok((token, expiration))
}

pub fn verify_token(token: &str, config: &Config) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(token_data.claims)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_data: Option<T>,
}

pub fn success_to_api_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: error_codes::SUCCESS,
        msg: "success".into(),
        resp_data: Some(data),
    })
}

pub fn error_to_api_response<T>(code: i32, msg: String) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code,
        msg,
        resp_data: None,
    })
}

pub mod error_codes {
    pub const SUCCESS: i32 = 0;
    pub const VALIDATION_ERROR: i32 = 1000;
    pub const PRECONDITION_FAILED: i32 = 1001;
    pub const AUTH_FAILED: i32 = 1002;
    pub const PERMISSION_DENIED: i32 = 1003;
    pub const NOT_FOUND: i32 = 1004;
    pub const RATE_LIMIT: i32 = 1005;
    pub const NOT_A_MEMBER: i32 = 1006;
    pub const INTERNAL_ERROR: i32 = 5000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_identity() {
        let config = Config::local();
        let identity = Identity::new("u1", "Alice");
        let (token, exp) = generate_token(&identity, &config).unwrap();
        let claims = verify_token(&token, &config).unwrap();
        assert_eq!(claims.exp, exp);
        assert_eq!(Identity::from(claims), identity);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let config = Config::local();
        let mut other = Config::local();
        other.jwt_secret = "another-secret".into();
        let (token, _) = generate_token(&Identity::new("u1", "Alice"), &other).unwrap();
        assert!(verify_token(&token, &config).is_err());
    }
}
