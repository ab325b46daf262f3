//! Error types for Casebook
//!
//! Every component error folds into [`CasebookError`], which knows its HTTP
//! status and how to render itself as a `{detail, code}` JSON body. The
//! `code` survives the wire so clients can rebuild the typed error.

use hyper::StatusCode;
use serde::{Deserialize, Serialize};

/// Main error type for Casebook operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CasebookError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid scope: {0}")]
    ScopeInvalid(String),

    #[error("Connection required: {0}")]
    ConnectionRequired(String),

    #[error("Token expired: {0}")]
    TokenExpired(String),

    #[error("Grant failed: {0}")]
    GrantError(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// JSON body returned on every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
    #[serde(default)]
    pub code: String,
}

impl CasebookError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ScopeInvalid(_) => StatusCode::BAD_REQUEST,
            Self::GrantError(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ConnectionRequired(_) => StatusCode::CONFLICT,
            Self::TokenExpired(_) => StatusCode::CONFLICT,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Stream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::GenerationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::ScopeInvalid(_) => "scope_invalid",
            Self::ConnectionRequired(_) => "connection_required",
            Self::TokenExpired(_) => "token_expired",
            Self::GrantError(_) => "grant_error",
            Self::Stream(_) => "stream_error",
            Self::GenerationFailure(_) => "generation_failure",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Unauthorized(_) => "unauthorized",
            Self::Provider(_) => "provider_error",
            Self::Unavailable(_) => "unavailable",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Human-readable detail without the variant prefix
    pub fn detail(&self) -> &str {
        match self {
            Self::BadRequest(d)
            | Self::ScopeInvalid(d)
            | Self::ConnectionRequired(d)
            | Self::TokenExpired(d)
            | Self::GrantError(d)
            | Self::Stream(d)
            | Self::GenerationFailure(d)
            | Self::NotFound(d)
            | Self::InvalidState(d)
            | Self::Unauthorized(d)
            | Self::Provider(d)
            | Self::Unavailable(d)
            | Self::Storage(d)
            | Self::Internal(d)
            | Self::Config(d) => d,
        }
    }

    /// True for errors the user resolves by granting access again
    pub fn needs_grant(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRequired(_) | Self::TokenExpired(_) | Self::GrantError(_)
        )
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = ErrorBody {
            detail: self.detail().to_string(),
            code: self.code().to_string(),
        };
        let body = serde_json::to_string(&body)
            .unwrap_or_else(|_| r#"{"detail":"internal error","code":"internal_error"}"#.into());
        (status, body)
    }

    /// Rebuild an error from a response status and its JSON body
    pub fn from_wire(status: StatusCode, body: ErrorBody) -> Self {
        let detail = body.detail;
        match body.code.as_str() {
            "bad_request" => Self::BadRequest(detail),
            "scope_invalid" => Self::ScopeInvalid(detail),
            "connection_required" => Self::ConnectionRequired(detail),
            "token_expired" => Self::TokenExpired(detail),
            "grant_error" => Self::GrantError(detail),
            "stream_error" => Self::Stream(detail),
            "generation_failure" => Self::GenerationFailure(detail),
            "not_found" => Self::NotFound(detail),
            "invalid_state" => Self::InvalidState(detail),
            "unauthorized" => Self::Unauthorized(detail),
            "provider_error" => Self::Provider(detail),
            "unavailable" => Self::Unavailable(detail),
            "storage_error" => Self::Storage(detail),
            "config_error" => Self::Config(detail),
            "internal_error" => Self::Internal(detail),
            _ => match status {
                StatusCode::UNAUTHORIZED => Self::Unauthorized(detail),
                StatusCode::NOT_FOUND => Self::NotFound(detail),
                StatusCode::BAD_REQUEST => Self::BadRequest(detail),
                StatusCode::CONFLICT => Self::InvalidState(detail),
                StatusCode::SERVICE_UNAVAILABLE => Self::Unavailable(detail),
                s if s.is_server_error() => Self::Internal(detail),
                _ => Self::BadRequest(detail),
            },
        }
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for CasebookError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CasebookError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for CasebookError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for CasebookError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

impl From<reqwest::Error> for CasebookError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Result type alias for Casebook operations
pub type Result<T> = std::result::Result<T, CasebookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CasebookError::ScopeInvalid("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CasebookError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            CasebookError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_body_carries_detail_and_code() {
        let (status, body) =
            CasebookError::ConnectionRequired("connect gmail".into()).into_status_code_and_body();
        assert_eq!(status, StatusCode::CONFLICT);

        let parsed: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.detail, "connect gmail");
        assert_eq!(parsed.code, "connection_required");
    }

    #[test]
    fn test_from_wire_round_trips_code() {
        let err = CasebookError::TokenExpired("drive".into());
        let (status, body) = err.clone().into_status_code_and_body();
        let parsed: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(CasebookError::from_wire(status, parsed), err);
    }

    #[test]
    fn test_from_wire_falls_back_to_status() {
        let body = ErrorBody {
            detail: "session expired".into(),
            code: String::new(),
        };
        assert_eq!(
            CasebookError::from_wire(StatusCode::UNAUTHORIZED, body),
            CasebookError::Unauthorized("session expired".into())
        );
    }
}
