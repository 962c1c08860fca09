//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an error may succeed on a fresh attempt.
///
/// Only `Transient` errors are eligible for retry; `Permanent` errors
/// abort the request immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Malformed payload, unknown tool id, hop depth exceeded
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Credentials absent or malformed
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credentials valid but scope insufficient
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Rate limited
    #[error("Throttled, retry after {retry_after:?}")]
    Throttled {
        /// How long the caller should wait before retrying
        retry_after: Duration,
    },

    /// Upstream circuit is open or no healthy tool exists
    #[error("Tool {tool_id} unavailable")]
    ToolUnavailable {
        tool_id: String,
        /// Remaining cooldown, when known
        retry_after: Option<Duration>,
        /// True when the circuit is half-open and the trial slot was taken;
        /// a retry shortly after may be admitted as the next trial
        half_open: bool,
    },

    /// Tool returned an error response
    #[error("Upstream error from {tool_id}: {message}")]
    Upstream {
        tool_id: String,
        /// HTTP-equivalent status from the tool, `None` for transport errors
        status: Option<u16>,
        message: String,
    },

    /// Upstream deadline exceeded
    #[error("Upstream timeout{}", .tool_id.as_deref().map(|t| format!(" calling {t}")).unwrap_or_default())]
    Timeout { tool_id: Option<String> },

    /// Client disconnected or shutdown requested
    #[error("Request cancelled")]
    Cancelled,

    /// Session write conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Counter-store or session-store failure
    #[error("Store error: {0}")]
    Store(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Uncaught bug; logged with trace id, returned without detail
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind string used in error frames and response codes
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "internal",
            Error::BadRequest(_) => "bad_request",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::PermissionDenied(_) => "permission_denied",
            Error::Throttled { .. } => "throttled",
            Error::ToolUnavailable { .. } => "tool_unavailable",
            Error::Upstream { .. } => "upstream_error",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled => "cancelled",
            Error::Conflict(_) => "conflict",
            Error::Store(_) => "internal",
            Error::Io(_) => "internal",
            Error::Internal(_) => "internal",
        }
    }

    /// Retry classification per the resilience policy.
    ///
    /// Network-level upstream failures, 5xx-equivalents and timeouts are
    /// transient. A `ToolUnavailable` is transient only with the half-open
    /// hint: the next attempt may win the trial slot. Cancellation is never
    /// retried.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Timeout { .. } => ErrorClass::Transient,
            Error::Store(_) => ErrorClass::Transient,
            Error::Io(_) => ErrorClass::Transient,
            Error::ToolUnavailable { half_open, .. } => {
                if *half_open {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Error::Upstream { status, .. } => match status {
                None => ErrorClass::Transient,
                Some(s) if *s >= 500 || *s == 408 || *s == 429 => ErrorClass::Transient,
                Some(_) => ErrorClass::Permanent,
            },
            _ => ErrorClass::Permanent,
        }
    }

    /// Retry-after hint carried by throttle and availability errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Throttled { retry_after } => Some(*retry_after),
            Error::ToolUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::ToolUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // 499 Client Closed Request; the response is rarely observable
            Error::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Store(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Stable error kind
    pub kind: String,

    /// HTTP status code
    pub status: u16,

    /// Seconds the caller should wait before retrying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: kind.into(),
            status: status.as_u16(),
            retry_after: None,
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();

        // Internal-class errors are logged in full but never leak detail
        let message = match &self {
            Error::Config(e) => {
                tracing::error!("Configuration error: {}", e);
                "Internal server error".to_string()
            }
            Error::Store(msg) => {
                tracing::error!("Store error: {}", msg);
                "Internal server error".to_string()
            }
            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                "Internal server error".to_string()
            }
            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            Error::Upstream { tool_id, status, .. } => {
                // Forward which tool failed, not its raw body
                format!(
                    "Upstream tool {} returned an error{}",
                    tool_id,
                    status.map(|s| format!(" (status {s})")).unwrap_or_default()
                )
            }
            other => other.to_string(),
        };

        let mut body = ErrorResponse::new(status, kind, message);
        body.retry_after = self.retry_after().map(|d| d.as_secs().max(1));

        let mut response = (status, Json(&body)).into_response();
        if let Some(secs) = body.retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// Manual From implementation for boxed figment errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadRequest(format!("Invalid JSON payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(Error::BadRequest("x".into()).kind(), "bad_request");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::Throttled { retry_after: Duration::from_secs(1) }.kind(),
            "throttled"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Unauthenticated("no token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::PermissionDenied("scope".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::Timeout { tool_id: None }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(Error::Conflict("session".into()).status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_retry_classification() {
        assert_eq!(Error::Timeout { tool_id: None }.class(), ErrorClass::Transient);
        assert_eq!(Error::BadRequest("x".into()).class(), ErrorClass::Permanent);
        assert_eq!(Error::Cancelled.class(), ErrorClass::Permanent);

        let open = Error::ToolUnavailable {
            tool_id: "spec_a".into(),
            retry_after: Some(Duration::from_millis(500)),
            half_open: false,
        };
        assert_eq!(open.class(), ErrorClass::Permanent);

        let trial_busy = Error::ToolUnavailable {
            tool_id: "spec_a".into(),
            retry_after: None,
            half_open: true,
        };
        assert_eq!(trial_busy.class(), ErrorClass::Transient);

        let server_err = Error::Upstream {
            tool_id: "spec_a".into(),
            status: Some(502),
            message: "bad gateway".into(),
        };
        assert_eq!(server_err.class(), ErrorClass::Transient);

        let client_err = Error::Upstream {
            tool_id: "spec_a".into(),
            status: Some(400),
            message: "bad request".into(),
        };
        assert_eq!(client_err.class(), ErrorClass::Permanent);
    }
}
