use crate::models::ApiError;
use crate::store::Store;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Identity threaded through protected handlers via request extensions.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: i64,
    pub email: String,
}

#[derive(Clone)]
pub struct AuthState {
    store: Store,
    limiter: Arc<TokenBuckets>,
}

impl AuthState {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

// The bearer token is nothing more than a wrapped user id; the dashboard is
// the only client and sessions do not expire server-side.
pub fn issue_token(user_id: i64) -> String {
    format!("session-{user_id}")
}

pub fn parse_token(token: &str) -> Option<i64> {
    token.rsplit('-').next()?.parse().ok()
}

/// Bearer-token middleware for the protected routes: resolve the user id from
/// the token, check the user still exists, then rate-limit per user.
pub async fn require_user_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(token) = extract_bearer(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_token",
            "Provide an Authorization: Bearer token",
        ));
    };

    let Some(user_id) = parse_token(&token) else {
        return Ok(unauthorized_response("invalid_token", "Malformed token"));
    };

    let user = match state.store.user_by_id(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return Ok(unauthorized_response("invalid_token", "Unknown user"));
        }
        Err(err) => {
            warn!(target = "marketsync.api", "auth lookup failed: {err}");
            return Ok(unauthorized_response("auth_unavailable", "Try again"));
        }
    };

    match state.limiter.consume(user.id).await {
        Ok(()) => {
            request.extensions_mut().insert(AuthContext {
                user_id: user.id,
                email: user.email,
            });
            Ok(next.run(request).await)
        }
        Err(retry_after) => {
            let mut response = too_many_requests("rate_limited", "Too many requests");
            response.headers_mut().insert(
                http::header::RETRY_AFTER,
                HeaderValue::from_str(&retry_after.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("1")),
            );
            Ok(response)
        }
    }
}

fn extract_bearer(headers: &http::HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?;
    let raw = value.to_str().ok()?;
    if raw.len() >= 7 && raw[..6].eq_ignore_ascii_case("bearer") {
        let token = raw[6..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<i64, BucketState>>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(20.0);
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, user_id: i64) -> Result<(), u64> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(user_id).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after = ((1.0 - state.tokens) / self.rate_per_sec).ceil().max(1.0);
            Err(retry_after as u64)
        }
    }
}
