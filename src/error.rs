//! # Error Handling
//!
//! This module defines the relay's error taxonomy and how each error becomes an
//! HTTP response.
//!
//! ## Error Categories:
//! - **ServiceUnavailable**: the upstream voice service could not be reached (503)
//! - **ConfigurationError**: credentials or configuration missing / rejected (500)
//! - **InvalidRequest**: the client sent something malformed (400)
//! - **ConnectionLost**: one leg of a duplex pair closed or failed (502)
//! - **NotFound**: the requested session does not exist (404)
//! - **Internal**: anything else that went wrong on our side (500)
//!
//! ## Key Rust Concepts:
//! - **From trait**: lets `?` convert library errors into `AppError` automatically
//! - **ResponseError trait**: lets handlers return `Result<_, AppError>` directly
//! - **Display trait**: the human-readable message used in logs and bodies

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::InvalidRequest("message is required".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// The upstream service is unreachable, timed out, or answered with a 5xx
    ServiceUnavailable(String),

    /// Missing credentials, or the upstream rejected our credentials/configuration
    ConfigurationError(String),

    /// Client sent invalid or malformed data
    InvalidRequest(String),

    /// Either side of a relayed connection pair closed or errored
    ConnectionLost(String),

    /// The requested session does not exist
    NotFound(String),

    /// Unexpected server-side failure
    Internal(String),
}

impl AppError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ConnectionLost(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error type, also used as the `code` of WebSocket error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::ConfigurationError(_) => "config_error",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::ConnectionLost(_) => "connection_lost",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// The bare message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            AppError::ServiceUnavailable(msg)
            | AppError::ConfigurationError(msg)
            | AppError::InvalidRequest(msg)
            | AppError::ConnectionLost(msg)
            | AppError::NotFound(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            AppError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "upstream unreachable: connection refused",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(AppError::status_code(self)).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigurationError(err.to_string())
    }
}

/// Transport-level failures talking to the provisioning API.
///
/// Connect failures and timeouts mean the service is unreachable; a body we
/// cannot decode means the service answered with something we don't understand,
/// which is still treated as the service being unusable right now.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::ServiceUnavailable(format!("upstream request timed out: {}", err))
        } else if err.is_connect() {
            AppError::ServiceUnavailable(format!("upstream unreachable: {}", err))
        } else if err.is_decode() {
            AppError::ServiceUnavailable(format!("upstream returned an unreadable response: {}", err))
        } else if err.is_builder() {
            AppError::ConfigurationError(format!("invalid upstream request: {}", err))
        } else {
            AppError::ServiceUnavailable(format!("upstream request failed: {}", err))
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Url(e) => AppError::ConfigurationError(format!("invalid upstream endpoint: {}", e)),
            WsError::Io(e) => AppError::ServiceUnavailable(format!("upstream socket unreachable: {}", e)),
            WsError::Http(response) => AppError::ServiceUnavailable(format!(
                "upstream refused the WebSocket upgrade with status {}",
                response.status()
            )),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                AppError::ConnectionLost("upstream connection closed".to_string())
            }
            other => AppError::ConnectionLost(other.to_string()),
        }
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::InvalidRequest(format!("invalid base64 payload: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
