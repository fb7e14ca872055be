//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::Error;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound(_) => ApiError::NotFound(message),
            Error::Validation(_) | Error::ConfigInvalid(_) => ApiError::BadRequest(message),
            Error::Conflict(_) | Error::LeaseLost(_) | Error::Canceled(_) => {
                ApiError::Conflict(message)
            }
            Error::Transient(_) => ApiError::Unavailable(message),
            Error::Delivery(_) => ApiError::InternalError(message),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::NotFound("pipeline x".into()), StatusCode::NOT_FOUND),
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (Error::ConfigInvalid("cycle".into()), StatusCode::BAD_REQUEST),
            (Error::Conflict("claimed".into()), StatusCode::CONFLICT),
            (Error::LeaseLost("stage".into()), StatusCode::CONFLICT),
            (Error::Transient("db".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
