//! Crate-wide error type.
//!
//! One variant per error kind in the error-handling design (§7): each maps to
//! an HTTP status and a metric category at the orchestrator boundary.

use thiserror::Error;

/// Errors produced anywhere in the request-servicing pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("auth failure: {0}")]
    AuthFailure(String),

    #[error("blocked by rule")]
    UnmatchedBlock,

    #[error("method not allowed")]
    UnsupportedMethod,

    #[error("no healthy render service and bypass unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream render timed out")]
    UpstreamTimeout,

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("cache blob failed to decompress")]
    DecompressionError,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl GatewayError {
    /// HTTP status this error kind is reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::AuthFailure(_) => 401,
            GatewayError::UnmatchedBlock => 403,
            GatewayError::UnsupportedMethod => 405,
            GatewayError::UpstreamUnavailable(_) => 502,
            GatewayError::UpstreamTimeout => 504,
            GatewayError::ConfigurationError(_) => 500,
            GatewayError::DecompressionError => 500,
            GatewayError::InternalError(_) => 500,
        }
    }

    /// Metric/log category label, stable across message text changes.
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::AuthFailure(_) => "auth_failure",
            GatewayError::UnmatchedBlock => "unmatched_block",
            GatewayError::UnsupportedMethod => "unsupported_method",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::ConfigurationError(_) => "configuration_error",
            GatewayError::DecompressionError => "decompression_error",
            GatewayError::InternalError(_) => "internal_error",
        }
    }

    /// Plain-text body the EG generates itself (cache/bypass bodies pass the origin's through).
    pub fn body(&self) -> String {
        match self {
            GatewayError::UpstreamUnavailable(_) => "Bad Gateway: Origin unreachable".to_string(),
            GatewayError::UpstreamTimeout => "Gateway Timeout".to_string(),
            GatewayError::AuthFailure(_) => "Unauthorized".to_string(),
            GatewayError::UnmatchedBlock => "Forbidden".to_string(),
            GatewayError::UnsupportedMethod => "Method Not Allowed".to_string(),
            GatewayError::InvalidRequest(msg) => format!("Bad Request: {msg}"),
            _ => "Internal Server Error".to_string(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<GatewayError> for Box<pingora_error::Error> {
    fn from(value: GatewayError) -> Self {
        use pingora_error::ErrorType::InternalError as PingoraInternal;
        pingora_error::Error::explain(PingoraInternal, value.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(value: std::io::Error) -> Self {
        GatewayError::InternalError(value.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(value: redis::RedisError) -> Self {
        GatewayError::InternalError(format!("directory error: {value}"))
    }
}
