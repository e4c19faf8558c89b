// Error kinds shared across the dispatch pipeline

use serde_json::{json, Value};
use thiserror::Error;

/// Errors produced anywhere between the HTTP surface and the egress worker.
///
/// The dispatch loop switches on these kinds to decide whether a failure is
/// retryable, whether it should rotate the active identity, and which status
/// code the client sees.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// Malformed client request (body parse, missing model, schema mismatch).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// API key missing or not in the configured list.
    #[error("invalid or missing API key")]
    AuthRejected,

    /// Non-2xx status from the upstream.
    #[error("upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    /// The worker's idle timeout fired before the upstream produced data.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Worker launch or handshake failed.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Send attempted while an identity switch is restarting the worker.
    #[error("worker is restarting")]
    WorkerRestarting,

    /// The bridge was shut down.
    #[error("worker closed")]
    WorkerClosed,

    /// The duplex channel to the worker dropped.
    #[error("worker channel disconnected")]
    Disconnected,

    /// The client went away; nothing left to answer.
    #[error("request canceled")]
    Canceled,

    /// No parseable identity file in the auth directory.
    #[error("no identity available")]
    NoIdentityAvailable,

    /// A converter hit a structure it cannot translate.
    #[error("format error: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status reported to the client when this error terminates a request.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) => 400,
            ProxyError::AuthRejected => 401,
            ProxyError::UpstreamStatus { status, .. } => *status,
            ProxyError::UpstreamTimeout => 504,
            ProxyError::WorkerUnavailable(_)
            | ProxyError::WorkerRestarting
            | ProxyError::WorkerClosed
            | ProxyError::NoIdentityAvailable => 503,
            ProxyError::Disconnected => 502,
            ProxyError::Canceled => 499,
            ProxyError::Format(_) => 502,
        }
    }

    /// Whether the dispatch loop may re-attempt after this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamStatus { .. }
                | ProxyError::UpstreamTimeout
                | ProxyError::WorkerUnavailable(_)
                | ProxyError::WorkerRestarting
                | ProxyError::Disconnected
        )
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) | ProxyError::Format(_) => "invalid_request_error",
            ProxyError::AuthRejected => "authentication_error",
            _ => "api_error",
        }
    }

    /// OpenAI-compatible error body.
    pub fn openai_body(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.status_code()
            }
        })
    }

    /// Gemini-compatible error body.
    pub fn gemini_body(&self) -> Value {
        let status = match self.status_code() {
            400 => "INVALID_ARGUMENT",
            401 => "UNAUTHENTICATED",
            429 => "RESOURCE_EXHAUSTED",
            503 => "UNAVAILABLE",
            504 => "DEADLINE_EXCEEDED",
            _ => "INTERNAL",
        };
        json!({
            "error": {
                "code": self.status_code(),
                "message": self.to_string(),
                "status": status
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ProxyError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(ProxyError::AuthRejected.status_code(), 401);
        assert_eq!(
            ProxyError::UpstreamStatus { status: 429, message: "quota".into() }.status_code(),
            429
        );
        assert_eq!(ProxyError::UpstreamTimeout.status_code(), 504);
        assert_eq!(ProxyError::NoIdentityAvailable.status_code(), 503);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ProxyError::UpstreamTimeout.retryable());
        assert!(ProxyError::WorkerRestarting.retryable());
        assert!(ProxyError::Disconnected.retryable());
        assert!(!ProxyError::BadRequest("x".into()).retryable());
        assert!(!ProxyError::Canceled.retryable());
    }

    #[test]
    fn test_openai_body_shape() {
        let body = ProxyError::AuthRejected.openai_body();
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], 401);
    }

    #[test]
    fn test_gemini_body_shape() {
        let body = ProxyError::UpstreamStatus { status: 429, message: "slow down".into() }
            .gemini_body();
        assert_eq!(body["error"]["code"], 429);
        assert_eq!(body["error"]["status"], "RESOURCE_EXHAUSTED");
    }
}
