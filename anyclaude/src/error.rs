//! Error taxonomy for the proxy core.
//!
//! Pre-stream errors become one JSON error response; post-stream errors
//! become a single SSE `error` event followed by `message_stop` (never a
//! second set of headers). The server side picks the representation via
//! [`ProxyError::status`] and [`ProxyError::error_type`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request body too large: {size} bytes (limit {limit})")]
    BodyTooLarge { size: u64, limit: u64 },
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("context too large: fixed overhead {overhead} tokens exceeds usable limit {limit}")]
    ContextTooLarge { overhead: u64, limit: u64 },
    #[error("no healthy node available")]
    NoHealthyNode,
    #[error("request canceled")]
    Canceled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status for the pre-stream JSON representation.
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) | ProxyError::ContextTooLarge { .. } => 400,
            ProxyError::BodyTooLarge { .. } => 413,
            ProxyError::UpstreamUnavailable(_) | ProxyError::NoHealthyNode => 503,
            ProxyError::UpstreamTimeout(_) => 504,
            ProxyError::UpstreamProtocol(_) | ProxyError::StreamInterrupted(_) => 502,
            ProxyError::Canceled | ProxyError::Internal(_) => 500,
        }
    }

    /// Anthropic wire `error.type` for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_)
            | ProxyError::BodyTooLarge { .. }
            | ProxyError::ContextTooLarge { .. } => "invalid_request_error",
            ProxyError::UpstreamUnavailable(_) | ProxyError::NoHealthyNode => "overloaded_error",
            ProxyError::UpstreamTimeout(_) => "timeout_error",
            ProxyError::UpstreamProtocol(_)
            | ProxyError::StreamInterrupted(_)
            | ProxyError::Canceled
            | ProxyError::Internal(_) => "api_error",
        }
    }

    /// JSON body for the pre-stream representation:
    /// `{"type":"error","error":{"type":…,"message":…}}`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        })
    }

    /// Classifies a reqwest transport error into the upstream taxonomy.
    pub fn from_transport(err: &reqwest::Error) -> ProxyError {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout(err.to_string())
        } else if err.is_connect() {
            ProxyError::UpstreamUnavailable(err.to_string())
        } else if err.is_decode() {
            ProxyError::UpstreamProtocol(err.to_string())
        } else {
            ProxyError::StreamInterrupted(err.to_string())
        }
    }
}
