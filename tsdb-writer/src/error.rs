use thiserror::Error;

/// Errors produced on the write path.
///
/// Transport implementations map their failures onto these variants so the
/// writer can decide whether a batch is worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The server rejected the write with an HTTP-style status code.
    #[error("Server error ({status}): {message}")]
    Server {
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Network error (connection refused, timeout, etc.).
    #[error("Network error: {message}")]
    Network { message: String },

    /// A record could not be encoded into line protocol.
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// The batch outlived its retry deadline.
    #[error("max retry time exceeded")]
    MaxRetryTimeExceeded,

    /// Invalid writer configuration.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl WriteError {
    /// Shorthand for a server error without a retry-after hint.
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        WriteError::Server {
            status,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Returns true if the write should be retried by default.
    ///
    /// Only structured server errors with a status of 429 or above qualify.
    /// A configured failure callback may override this.
    pub fn is_retryable(&self) -> bool {
        match self {
            WriteError::Server { status, .. } => *status >= 429,
            _ => false,
        }
    }

    /// Returns the server-suggested retry delay in seconds, if available.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            WriteError::Server {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type for write path operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_display() {
        let err = WriteError::server(503, "service unavailable");
        assert_eq!(err.to_string(), "Server error (503): service unavailable");
        assert_eq!(
            WriteError::MaxRetryTimeExceeded.to_string(),
            "max retry time exceeded"
        );
    }

    #[test]
    fn test_write_error_is_retryable() {
        assert!(WriteError::server(429, "too many requests").is_retryable());
        assert!(WriteError::server(500, "internal").is_retryable());
        assert!(WriteError::server(503, "unavailable").is_retryable());
        assert!(!WriteError::server(400, "bad request").is_retryable());
        assert!(!WriteError::server(401, "unauthorized").is_retryable());
        assert!(!WriteError::Network {
            message: "connection reset".to_string()
        }
        .is_retryable());
        assert!(!WriteError::Encoding {
            message: "bad field".to_string()
        }
        .is_retryable());
        assert!(!WriteError::MaxRetryTimeExceeded.is_retryable());
    }

    #[test]
    fn test_write_error_retry_after() {
        let err = WriteError::Server {
            status: 429,
            message: "slow down".to_string(),
            retry_after_secs: Some(30),
        };
        assert_eq!(err.retry_after(), Some(30));
        assert_eq!(WriteError::server(503, "x").retry_after(), None);
        assert_eq!(WriteError::MaxRetryTimeExceeded.retry_after(), None);
    }
}
