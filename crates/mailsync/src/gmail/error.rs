//! Remote call failures

use thiserror::Error;

/// Classified failure of a remote mail API call.
///
/// `Clone` so a single token refresh outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    /// Server rejected the access token (401)
    #[error("access token rejected")]
    Unauthenticated,

    /// Refreshing did not help, or there is no refresh token. The user
    /// must sign in again.
    #[error("account needs to be re-authenticated")]
    ReauthRequired,

    #[error("rate limited by server")]
    RateLimited,

    #[error("not found")]
    NotFound,

    /// History cursor unknown or expired (404 from the history endpoint)
    #[error("history cursor is invalid or expired")]
    InvalidCursor,

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Worth retrying an idempotent request for
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::Connection(_) => true,
            ApiError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthenticated | ApiError::ReauthRequired)
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => ApiError::Unauthenticated,
            429 => ApiError::RateLimited,
            403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
                ApiError::RateLimited
            }
            404 => ApiError::NotFound,
            _ => ApiError::Server {
                status,
                message: truncate(body, 200),
            },
        }
    }
}

impl From<ureq::Error> for ApiError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Timeout(_) => ApiError::Timeout,
            ureq::Error::StatusCode(status) => ApiError::from_status(status, ""),
            ureq::Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ApiError::Timeout,
                _ => ApiError::Connection(e.to_string()),
            },
            ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => {
                ApiError::Connection(err.to_string())
            }
            ureq::Error::Json(e) => ApiError::Decode(e.to_string()),
            other => ApiError::Other(other.to_string()),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ApiError::from_status(401, ""), ApiError::Unauthenticated);
        assert_eq!(ApiError::from_status(429, ""), ApiError::RateLimited);
        assert_eq!(
            ApiError::from_status(403, r#"{"error":{"errors":[{"reason":"rateLimitExceeded"}]}}"#),
            ApiError::RateLimited
        );
        assert_eq!(ApiError::from_status(404, ""), ApiError::NotFound);
        assert!(matches!(
            ApiError::from_status(403, "forbidden"),
            ApiError::Server { status: 403, .. }
        ));
    }

    #[test]
    fn test_transient() {
        assert!(ApiError::Timeout.is_transient());
        assert!(ApiError::Connection("reset".into()).is_transient());
        assert!(ApiError::from_status(503, "").is_transient());
        assert!(!ApiError::from_status(400, "").is_transient());
        assert!(!ApiError::RateLimited.is_transient());
        assert!(!ApiError::Unauthenticated.is_transient());
        assert!(!ApiError::InvalidCursor.is_transient());
    }

    #[test]
    fn test_server_message_is_truncated() {
        let long = "x".repeat(500);
        match ApiError::from_status(500, &long) {
            ApiError::Server { message, .. } => assert_eq!(message.len(), 203),
            other => panic!("unexpected {other:?}"),
        }
    }
}
