//! Error types for tbmon-cloud crate

use thiserror::Error;

/// Errors from publishing and caching
#[derive(Debug, Error)]
pub enum CloudError {
    /// Connection could not be established
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// Request did not complete in time
    #[error("Operation timed out")]
    Timeout,

    /// Server-side failure (5xx, 408, 429); worth retrying
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Server refused the payload (bad key, malformed body); never retried
    #[error("Rejected by server: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Database error (offline cache)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl CloudError {
    /// Check if a failed publish may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::Unreachable(_) | CloudError::Timeout | CloudError::Server { .. }
        )
    }

    /// Create a server error from status and message
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        CloudError::Server {
            status,
            message: message.into(),
        }
    }

    /// Create a rejection from status and message
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        CloudError::Rejected {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CloudError::Timeout
        } else if e.is_builder() {
            CloudError::Config(e.to_string())
        } else {
            CloudError::Unreachable(e.to_string())
        }
    }
}

/// Result type for cloud operations
pub type CloudResult<T> = Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(CloudError::server(500, "Internal error").is_retryable());
        assert!(CloudError::Timeout.is_retryable());
        assert!(CloudError::Unreachable("dns".to_string()).is_retryable());
        assert!(!CloudError::rejected(400, "malformed").is_retryable());
        assert!(!CloudError::Config("bad proxy".to_string()).is_retryable());
    }
}
