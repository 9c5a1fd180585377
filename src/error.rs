use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::board::MoveError;
use crate::energy::EnergyError;
use crate::matchmaking::MatchmakingError;

/// Errors surfaced by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("no energy left")]
    NoEnergy { next_life_in_secs: Option<u64> },
    #[error("too many requests")]
    RateLimited { retry_after_secs: u64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::NoEnergy { .. } => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::RateLimited { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({ "error": "Too many requests", "retryAfterSecs": retry_after_secs })),
            )
                .into_response(),
            Self::NoEnergy { next_life_in_secs } => (
                status,
                Json(json!({ "error": "No energy left", "nextLifeInSecs": next_life_in_secs })),
            )
                .into_response(),
            Self::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (status, Json(json!({ "error": "Internal server error" }))).into_response()
            }
            other => (status, Json(json!({ "error": other.to_string() }))).into_response(),
        }
    }
}

impl From<MoveError> for AppError {
    fn from(err: MoveError) -> Self {
        match err {
            MoveError::NotAPlayer => Self::Forbidden(err.to_string()),
            _ => Self::Conflict(err.to_string()),
        }
    }
}

impl From<MatchmakingError> for AppError {
    fn from(err: MatchmakingError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl From<EnergyError> for AppError {
    fn from(err: EnergyError) -> Self {
        match err {
            EnergyError::Empty { next_life_in_secs } => Self::NoEnergy { next_life_in_secs },
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(_: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized("Invalid or expired token".to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
