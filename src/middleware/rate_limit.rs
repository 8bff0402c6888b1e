use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use redis::AsyncCommands;

use crate::{
    config::Config,
    utils::{error_codes, error_to_api_response},
};

/// Fixed-window request counter per client IP, kept in redis.
#[derive(Clone)]
pub struct RateLimiter {
    redis: Arc<redis::Client>,
    window_secs: u64,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(redis: Arc<redis::Client>, config: &Config) -> Self {
        Self {
            redis,
            window_secs: config.rate_limit_window().as_secs(),
            max_requests: config.rate_limit_requests,
        }
    }

    /// Returns `true` while the caller is within its budget. Redis failures
    /// let the request through.
    async fn admit(&self, ip: &str) -> bool {
        let key = format!("rate_limit:{}", ip);
        let mut conn = match self.redis.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Rate limiter unavailable: {}", e);
                return true;
            }
        };

        let count: i64 = match conn.incr(&key, 1).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Rate limiter INCR failed: {}", e);
                return true;
            }
        };
        if count == 1 {
            let _: Result<(), redis::RedisError> =
                conn.expire(&key, self.window_secs as i64).await;
        }
        count <= self.max_requests as i64
    }
}

/// Client address: `x-real-ip`, then the first `x-forwarded-for` entry, then
/// the socket peer.
pub fn client_ip(req: &Request) -> String {
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());
    req.headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .or(remote_ip.as_deref())
        .unwrap_or("unknown")
        .trim()
        .to_string()
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    if !limiter.admit(&ip).await {
        tracing::info!("Rate limit exceeded for {}", ip);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            error_to_api_response::<()>(
                error_codes::RATE_LIMIT,
                format!(
                    "too many requests, retry in {} seconds",
                    limiter.window_secs
                ),
            ),
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn forwarded_headers_take_precedence() {
        let req = Request::builder()
            .header("x-forwarded-for", " , 10.0.0.7, 10.0.0.8")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "10.0.0.7");

        let req = Request::builder()
            .header("x-real-ip", "192.168.1.2")
            .header("x-forwarded-for", "10.0.0.7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "192.168.1.2");
    }

    #[test]
    fn unknown_without_any_source() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&req), "unknown");
    }
}
