use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::types::{Role, User};

const HASH_ROUNDS: usize = 10_000;
const SALT_BYTES: usize = 16;

pub fn new_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Salted, iterated SHA-256, hex encoded.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..HASH_ROUNDS {
        digest = Sha256::new()
            .chain_update(salt.as_bytes())
            .chain_update(digest)
            .finalize();
    }
    hex::encode(digest)
}

pub fn verify_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    let actual = hash_password(password, salt);
    if actual.len() != expected_hash.len() {
        return false;
    }
    actual
        .bytes()
        .zip(expected_hash.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Run password hashing work on the blocking pool.
pub async fn off_thread<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("Blocking task failed: {e}")))?
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

pub fn issue_token(user: &User, cfg: &ServerConfig) -> AppResult<String> {
    let exp = Utc::now() + chrono::Duration::hours(cfg.token_ttl_hours as i64);
    let claims = Claims {
        sub: user.id,
        role: user.role,
        exp: exp.timestamp().max(0) as usize,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("token encoding failed: {e}")))
}

pub fn decode_token(token: &str, secret: &str) -> AppResult<Claims> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

/// Resolve a token to a live, non-banned user and touch `last_seen`.
pub fn authenticate(state: &AppState, token: &str) -> AppResult<User> {
    let claims = decode_token(token, &state.config.jwt_secret)?;
    let user = state
        .store
        .update_user(claims.sub, |u| {
            u.last_seen = Utc::now();
            u.clone()
        })
        .ok_or_else(|| AppError::Unauthorized("Account no longer exists".to_string()))?;
    if user.banned {
        return Err(AppError::forbidden("Account is banned"));
    }
    Ok(user)
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Extractor for any signed-in user.
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;
        authenticate(state, token).map(AuthUser)
    }
}

/// Extractor for users with the admin role.
pub struct AdminUser(pub User);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if user.role != Role::Admin {
            return Err(AppError::forbidden("Admin access required"));
        }
        Ok(AdminUser(user))
    }
}
