use thiserror::Error;

use crate::utils::truncate_string;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Upload session no longer exists: {0}")]
    SessionGone(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("No data transferred for {0} seconds")]
    Stalled(u64),

    #[error("Response ended after {actual} of {expected} bytes")]
    Truncated { expected: u64, actual: u64 },

    #[error("Remote acknowledged no new bytes past offset {0}")]
    NoProgress(u64),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Authorization error {code}: {description}")]
    OAuth { code: String, description: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Authorization redirect failed: {0}")]
    Redirect(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = truncate_string(body, MAX_ERROR_BODY_LENGTH);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 if Self::is_rate_limit_reason(body) => ApiError::RateLimited,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            408 => ApiError::Timeout,
            410 => ApiError::SessionGone(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Drive reports quota exhaustion as 403 with a rate-limit reason in the body.
    fn is_rate_limit_reason(body: &str) -> bool {
        body.contains("userRateLimitExceeded") || body.contains("rateLimitExceeded")
    }

    /// Whether the same request may succeed if simply tried again later.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimited
            | ApiError::ServerError(_)
            | ApiError::Timeout
            | ApiError::Stalled(_)
            | ApiError::Truncated { .. }
            | ApiError::NoProgress(_) => true,
            ApiError::NetworkError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            _ => false,
        }
    }

    /// True when the token endpoint rejected a refresh handle outright.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, ApiError::OAuth { code, .. } if code == "invalid_grant")
    }
}
