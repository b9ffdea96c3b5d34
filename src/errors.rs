use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Errors raised by the storage core and its adapters.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("uniqueness violation: {0}")]
    Conflict(String),
    #[error("bucket `{0}` not found")]
    BucketNotFound(i64),
    #[error("object `{id}` not found in bucket `{bkt_id}`")]
    ObjectNotFound { bkt_id: i64, id: i64 },
    #[error("data `{id}` (sn {sn}) not found in bucket `{bkt_id}`")]
    DataNotFound { bkt_id: i64, id: i64, sn: i32 },
    #[error("integrity mismatch: {0}")]
    Integrity(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("object `{id}` cannot move from {from} to {to}")]
    InvalidTransition { id: i64, from: String, to: String },
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("identifier source returned no id")]
    IdExhausted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::BucketNotFound(_)
            | CoreError::ObjectNotFound { .. }
            | CoreError::DataNotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Integrity(_)
            | CoreError::IdExhausted
            | CoreError::Sqlx(_)
            | CoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_409() {
        let err: AppError = CoreError::Conflict("obj.name".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.message.contains("obj.name"));
    }

    #[test]
    fn test_not_found_variants_map_to_404() {
        let cases = [
            CoreError::BucketNotFound(1),
            CoreError::ObjectNotFound { bkt_id: 1, id: 2 },
            CoreError::DataNotFound {
                bkt_id: 1,
                id: 2,
                sn: -1,
            },
        ];
        for err in cases {
            assert_eq!(AppError::from(err).status, StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn test_adapter_failures_stay_opaque_500() {
        let err: AppError = CoreError::Io(io::Error::other("disk gone")).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "disk gone");
    }
}
