//! Domain error taxonomy, mapped onto the `§7` error kinds. Mirrors
//! `rofl-scheduler/src/serverd/error.rs`'s pattern of a small enum with an
//! `IntoResponse` impl, plus a catch-all `Other(anyhow::Error)` arm for
//! internal plumbing failures that a caller was never meant to match on.

use axum::http::StatusCode;
use axum::response::{self, IntoResponse};
use thiserror::Error;

/// The `§7` error taxonomy. Every component-facing error reduces to one of
/// these kinds before it reaches an HTTP or push-bus caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("expired")]
    Expired,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rate limited")]
    RateLimited,
    #[error("unavailable")]
    Unavailable,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn already_assigned() -> Self {
        Self::Conflict("already-assigned")
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not-found",
            Self::Conflict(_) => "conflict",
            Self::Expired => "expired",
            Self::InvalidInput(_) => "invalid-input",
            Self::RateLimited => "rate-limited",
            Self::Unavailable => "unavailable",
            Self::Other(_) => "internal",
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> response::Response {
        let status = match &self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Expired => StatusCode::GONE,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = response::Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
