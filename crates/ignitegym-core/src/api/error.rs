use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Why the backend refused an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnauthorizedReason {
    /// `token.expired`
    TokenExpired,
    /// `token.invalid`
    TokenInvalid,
    /// 401 without a message
    Unspecified,
    /// 401 carrying any other message, e.g. wrong credentials
    Other(String),
}

impl UnauthorizedReason {
    fn from_message(message: Option<&str>) -> Self {
        match message.map(str::trim) {
            None | Some("") => UnauthorizedReason::Unspecified,
            Some("token.expired") => UnauthorizedReason::TokenExpired,
            Some("token.invalid") => UnauthorizedReason::TokenInvalid,
            Some(other) => UnauthorizedReason::Other(other.to_string()),
        }
    }

    /// Whether a token refresh can fix this failure.
    pub fn is_token_failure(&self) -> bool {
        !matches!(self, UnauthorizedReason::Other(_))
    }
}

impl fmt::Display for UnauthorizedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnauthorizedReason::TokenExpired => f.write_str("token expired"),
            UnauthorizedReason::TokenInvalid => f.write_str("token invalid"),
            UnauthorizedReason::Unspecified => f.write_str("token may be expired"),
            UnauthorizedReason::Other(message) => f.write_str(message),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized - {0}")]
    Unauthorized(UnauthorizedReason),

    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Too many requests waiting for a session refresh (limit {limit})")]
    QueueOverflow { limit: usize },

    #[error("{0}")]
    Validation(String),

    /// Server-provided, user-facing error message.
    #[error("{message}")]
    App { status: u16, message: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    fn server_message(body: &str) -> Option<String> {
        serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
            .filter(|m| !m.trim().is_empty())
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = Self::server_message(body);
        if status == 401 {
            return ApiError::Unauthorized(UnauthorizedReason::from_message(message.as_deref()));
        }
        if let Some(message) = message {
            return match status {
                400 | 422 => ApiError::Validation(message),
                _ => ApiError::App { status, message },
            };
        }

        let truncated = Self::truncate_body(body);
        match status {
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Unauthorized reason, if this is a 401.
    pub fn unauthorized_reason(&self) -> Option<&UnauthorizedReason> {
        match self {
            ApiError::Unauthorized(reason) => Some(reason),
            _ => None,
        }
    }

    /// Failures worth trying again later without changing credentials.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::NetworkError(_)
            | ApiError::Timeout(_)
            | ApiError::RateLimited
            | ApiError::ServerError(_) => true,
            ApiError::App { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Message suitable for a toast: the server's own text when it sent one.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::App { message, .. } | ApiError::Validation(message) => message.clone(),
            ApiError::Unauthorized(UnauthorizedReason::Other(message)) => message.clone(),
            // Sign-out, when it happens, is announced through session events.
            ApiError::Unauthorized(_) => "Could not confirm your session. Please try again.".to_string(),
            ApiError::RefreshFailed(_) => "Your session has expired. Please sign in again.".to_string(),
            ApiError::NetworkError(_) | ApiError::Timeout(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            other => format!("Something went wrong, please try again later ({})", other),
        }
    }
}
