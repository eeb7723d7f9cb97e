//! Errors from the assessment backend transport and its response envelope

use thiserror::Error;

/// Errors that can occur when talking to the assessment backend
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Connection refused, DNS failure, timeout
    #[error("network error: {message}")]
    Network { message: String },

    /// Non-2xx status other than 401
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// 401 - the student's session is gone
    #[error("session expired")]
    SessionExpired,

    /// Response body that cannot be used (null payload, wrong shape)
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// `{code, msg}` envelope without an `obj` payload
    #[error("backend error {code}: {message}")]
    ErrorEnvelope { code: String, message: String },

    /// Payload did not match the expected record
    #[error("failed to decode payload: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        ApiError::Network {
            message: message.into(),
        }
    }

    pub fn http(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        ApiError::Http {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        ApiError::InvalidResponse(message.into())
    }

    pub fn envelope(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::ErrorEnvelope {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        ApiError::Decode(message.into())
    }

    /// Check if this is an authentication error
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired)
    }

    /// HTTP status, when the backend answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::SessionExpired => Some(401),
            _ => None,
        }
    }

    /// Transient failures worth another attempt for idempotent requests
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network { .. } => true,
            ApiError::Http { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::decode(err.to_string())
    }
}
