//! Error types for the Gantry client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the Gantry client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// The resource changed underneath the caller, e.g. a stage lease was lost
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(s) if (400..500).contains(&s))
    }

    /// Server-side or connection failure worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(e) => e.is_connect() || e.is_timeout(),
            Self::ApiError { status, .. } => *status >= 500,
            Self::ParseError(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let missing = ClientError::api_error(404, "execution not found");
        assert!(missing.is_not_found());
        assert!(missing.is_client_error());
        assert!(!missing.is_retryable());

        let lost = ClientError::api_error(409, "lease lost");
        assert!(lost.is_conflict());

        let unavailable = ClientError::api_error(503, "try again");
        assert!(unavailable.is_retryable());
        assert!(!unavailable.is_client_error());

        assert!(!ClientError::ParseError("bad".into()).is_retryable());
    }
}
