//!
//! Error handling for the Anthropic to OpenAI proxy server.
//!
//! Defines all error types used throughout the application using thiserror
//! for ergonomic error handling. Every failure in the core is classified
//! into exactly one Anthropic error kind and one outer HTTP status; the
//! mapping lives here so that handlers and the stream generator agree.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use axum::http::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

/* --- constants ------------------------------------------------------------------------------ */

/** Markers that identify a rate-limited upstream reply regardless of status code */
const RATE_LIMIT_MARKERS: &[&str] = &[
    "tpm",
    "rpm",
    "rate limit",
    "too many requests",
    "rate_limit_exceeded",
    "quota exceeded",
];

/** Value of the `retry-after` header attached to every 429 response */
pub const RETRY_AFTER_SECS: &str = "60";

/* --- types ----------------------------------------------------------------------------------- */

///
/// Application error types covering every failure mode of the proxy core.
///
/// Each variant carries enough context to produce the Anthropic error
/// envelope `{"type":"error","error":{"type":<kind>,"message":<msg>}}`
/// plus the outer HTTP status. Uses thiserror for automatic Display and
/// Error trait implementations.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request body is missing a required field or is not an object.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request body has the right shape but a field failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream rejected our credentials (401/403 passed through).
    #[error("Authentication error: {message}")]
    Auth { status: u16, message: String },

    /// Upstream is rate limiting; 449 is collapsed into this as well.
    #[error("{0}")]
    RateLimit(String),

    /// Upstream returned 5xx, an unusable body, or the network failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream did not answer within the configured deadline.
    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Streaming error: {0}")]
    Streaming(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/* --- start of code -------------------------------------------------------------------------- */

impl ProxyError {
    ///
    /// The Anthropic error kind for this failure.
    ///
    /// The kind set is closed: `invalid_request_error`,
    /// `authentication_error`, `rate_limit_error`, `api_error`,
    /// `conversion_error`, `streaming_error`, `server_error`.
    ///
    /// # Returns
    ///  * Static kind string for the error envelope
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::Validation(_) => "invalid_request_error",
            ProxyError::Auth { .. } => "authentication_error",
            ProxyError::RateLimit(_) => "rate_limit_error",
            ProxyError::Upstream(_) | ProxyError::Timeout(_) | ProxyError::Request(_) => {
                "api_error"
            }
            ProxyError::Conversion(_) | ProxyError::Serialization(_) => "conversion_error",
            ProxyError::Streaming(_) => "streaming_error",
            ProxyError::Config(_) | ProxyError::Internal(_) => "server_error",
        }
    }

    ///
    /// The outer HTTP status for this failure.
    ///
    /// # Returns
    ///  * HTTP status code matching the classification table
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyError::Auth { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::UNAUTHORIZED)
            }
            ProxyError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Conversion(_) | ProxyError::Serialization(_) => StatusCode::BAD_REQUEST,
            ProxyError::Streaming(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            ProxyError::Config(_) | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    ///
    /// Build the Anthropic error envelope for this failure.
    ///
    /// # Returns
    ///  * `{"type":"error","error":{"type":<kind>,"message":<msg>}}`
    pub fn to_envelope(&self) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        })
    }

    /// Whether this failure is a rate-limit condition (drives 429 headers).
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProxyError::RateLimit(_))
    }
}

///
/// Detect the rate-limit signature in an upstream reply.
///
/// A reply is rate limited when the status is 429 or 449, or when the body
/// contains any of the known textual markers (`TPM`, `RPM`, `rate limit`,
/// `too many requests`, `rate_limit_exceeded`, `quota exceeded`).
///
/// # Arguments
///  * `status` - upstream HTTP status code
///  * `body` - upstream response body text
///
/// # Returns
///  * `true` if the reply carries a rate-limit signature
pub fn is_rate_limit_signature(status: u16, body: &str) -> bool {
    if status == 429 || status == 449 {
        return true;
    }
    let lowered = body.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

///
/// Classify a non-2xx upstream reply into a proxy error.
///
/// 429 and 449 (and any body with a rate-limit marker) collapse into
/// `RateLimit`; 401/403 pass through as `Auth`; everything else surfaces
/// as an upstream API error behind 502.
///
/// # Arguments
///  * `status` - upstream HTTP status code
///  * `body` - upstream response body text
///
/// # Returns
///  * Classified `ProxyError`
pub fn classify_upstream(status: u16, body: &str) -> ProxyError {
    if is_rate_limit_signature(status, body) {
        let message = extract_upstream_message(body)
            .unwrap_or_else(|| "Your account has hit a rate limit.".to_string());
        return ProxyError::RateLimit(message);
    }

    match status {
        401 | 403 => ProxyError::Auth {
            status,
            message: extract_upstream_message(body)
                .unwrap_or_else(|| "Upstream rejected the configured API key.".to_string()),
        },
        _ => ProxyError::Upstream(format!("Upstream returned status {}: {}", status, body)),
    }
}

///
/// Pull a human-readable message out of an upstream error body.
///
/// Upstreams disagree on the field name: some use `msg`, some `message`,
/// some nest it under `error.message`.
///
/// # Arguments
///  * `body` - raw upstream body text
///
/// # Returns
///  * `Some(message)` when a message field was found, `None` otherwise
pub fn extract_upstream_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("msg")
        .or_else(|| value.get("message"))
        .or_else(|| value.get("error").and_then(|e| e.get("message")))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
}

/// Result type alias for cleaner error handling throughout the application
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_449_collapses_to_rate_limit() {
        let err = classify_upstream(449, r#"{"status":"449","msg":"rate limit exceeded"}"#);
        assert!(err.is_rate_limit());
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.kind(), "rate_limit_error");
    }

    #[test]
    fn test_body_marker_collapses_to_rate_limit() {
        let err = classify_upstream(400, "TPM limit reached for this key");
        assert!(err.is_rate_limit());
    }

    #[test]
    fn test_auth_passthrough_status() {
        let err = classify_upstream(403, r#"{"message":"forbidden"}"#);
        assert_eq!(err.kind(), "authentication_error");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_5xx_is_api_error() {
        let err = classify_upstream(503, "upstream down");
        assert_eq!(err.kind(), "api_error");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_envelope_shape() {
        let err = ProxyError::RateLimit("slow down".to_string());
        let envelope = err.to_envelope();
        assert_eq!(envelope["type"], "error");
        assert_eq!(envelope["error"]["type"], "rate_limit_error");
        assert_eq!(envelope["error"]["message"], "slow down");
    }

    #[test]
    fn test_upstream_message_extraction() {
        assert_eq!(
            extract_upstream_message(r#"{"msg":"hit the wall"}"#).as_deref(),
            Some("hit the wall")
        );
        assert_eq!(
            extract_upstream_message(r#"{"error":{"message":"nested"}}"#).as_deref(),
            Some("nested")
        );
        assert_eq!(extract_upstream_message("not json"), None);
    }
}
