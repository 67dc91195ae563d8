use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("temporarily unavailable: {0}")]
    TransientIo(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the user can reasonably retry the same action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::TransientIo(_))
    }

    /// Message safe to show to the user. Security faults stay opaque.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Unauthorized(_) => {
                "Could not verify your account. Please log out and log in again.".to_string()
            }
            ChatError::NotFound(_) => "Chat not found.".to_string(),
            ChatError::TransientIo(_) => {
                "Connection problem. Please try again in a moment.".to_string()
            }
            ChatError::InvariantViolation(_) => "Something went wrong.".to_string(),
            ChatError::InvalidInput(reason) => reason.clone(),
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ChatError::NotFound("row not found".to_string()),
            other => ChatError::TransientIo(format!("store: {other}")),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::TransientIo(format!("responder: {err}"))
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::TransientIo(format!("local storage: {err}"))
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status_code(),
            Json(json!({ "error": self.user_message(), "retryable": self.is_retryable() })),
        )
            .into_response()
    }
}
