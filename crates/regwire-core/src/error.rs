//! Error types for registry operations.
//!
//! This module provides the error hierarchy for regwire, including the HTTP
//! status code mapping used by the request engine when classifying registry
//! responses.

use reqwest::StatusCode;
use thiserror::Error;

/// Maximum number of response-body bytes carried as diagnostic context.
pub const BODY_EXCERPT_LIMIT: usize = 512;

/// Main error type for registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation was canceled before it completed
    #[error("Request canceled: {0}")]
    Canceled(String),

    /// Every candidate host was attempted and none produced a response
    #[error("All requests failed")]
    AllRequestsFailed,

    /// A host reached its retry limit and was taken out of rotation
    #[error("Backoff limit reached for {0}")]
    BackoffLimit(String),

    /// Resource not found (HTTP 404, or no response at all)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication or authorization failed (HTTP 401, 403)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The registry is rate limiting us (HTTP 429)
    #[error("Rate limited: {0}")]
    RateLimit(String),

    /// Any other non-2xx HTTP response
    #[error("HTTP status {status}: {detail}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Status text plus a response-body excerpt
        detail: String,
    },

    /// The host does not support the requested API (e.g. HEAD disabled)
    #[error("Unsupported API: {0}")]
    UnsupportedApi(String),

    /// An auth challenge was expected but the response carried none
    #[error("Empty challenge: {0}")]
    EmptyChallenge(String),

    /// The auth challenge did not change from the previous attempt
    #[error("No new challenge: {0}")]
    NoNewChallenge(String),

    /// The response body length contradicts the expected length
    #[error("Content length mismatch: expected {expected}, received {actual}")]
    ContentLengthMismatch {
        /// Length the caller or a previous response established
        expected: u64,
        /// Length the current response advertised
        actual: u64,
    },

    /// A transfer cannot be resumed under the caller's own Range header
    #[error("Unable to resume request with a caller-provided Range: {0}")]
    UnresumableRange(String),

    /// A ranged request was answered without a Content-Range header
    #[error("Missing Content-Range in ranged response: {0}")]
    MissingContentRange(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid URL or endpoint
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The throttle refused or could not service the acquire
    #[error("Throttle unavailable: {0}")]
    Throttle(String),

    /// The HTTP transport failed before a status line was received
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A response could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Specialized result type for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Canceled(_) => "CANCELED",
            Self::AllRequestsFailed => "ALL_REQUESTS_FAILED",
            Self::BackoffLimit(_) => "BACKOFF_LIMIT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::HttpStatus { .. } => "HTTP_STATUS",
            Self::UnsupportedApi(_) => "UNSUPPORTED_API",
            Self::EmptyChallenge(_) => "EMPTY_CHALLENGE",
            Self::NoNewChallenge(_) => "NO_NEW_CHALLENGE",
            Self::ContentLengthMismatch { .. } => "CONTENT_LENGTH_MISMATCH",
            Self::UnresumableRange(_) => "UNRESUMABLE_RANGE",
            Self::MissingContentRange(_) => "MISSING_CONTENT_RANGE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidEndpoint(_) => "INVALID_ENDPOINT",
            Self::Throttle(_) => "THROTTLE_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Parse(_) => "PARSE_ERROR",
        }
    }

    /// Returns true for protocol faults that must not be retried.
    ///
    /// When the engine produces one of these while an earlier error is
    /// already recorded, the earlier error is returned unchanged so the true
    /// cause is preserved.
    #[must_use]
    pub const fn is_not_retryable(&self) -> bool {
        matches!(
            self,
            Self::ContentLengthMismatch { .. } | Self::UnresumableRange(_)
        )
    }

    /// Map an HTTP response status to an error kind.
    ///
    /// `detail` carries the status text and a response-body excerpt so that
    /// user-visible failures identify what the registry actually said.
    #[must_use]
    pub fn from_status(status: StatusCode, url: &str, body: &[u8]) -> Self {
        let detail = format!(
            "{} {} [{}]",
            url,
            status
                .canonical_reason()
                .unwrap_or("unrecognized status code"),
            body_excerpt(body)
        );
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Unauthorized(detail),
            StatusCode::NOT_FOUND => Self::NotFound(detail),
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimit(detail),
            _ => Self::HttpStatus {
                status: status.as_u16(),
                detail,
            },
        }
    }
}

/// Truncate a response body into a printable diagnostic excerpt.
#[must_use]
pub fn body_excerpt(body: &[u8]) -> String {
    let end = body.len().min(BODY_EXCERPT_LIMIT);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

// Conversions from external error types
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_builder() {
            Self::Config(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidEndpoint(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
