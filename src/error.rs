//! Error taxonomy for the forwarding engine.
//!
//! Every failure of a single exchange maps to exactly one variant and one
//! HTTP status. Only `ConfigurationConflict` is fatal, and only at startup.

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

/// Boxed error type used for transport sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Ambiguous or invalid rule set, detected when the rule set is built.
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// Connect failure, refusal, or I/O failure before the response started.
    #[error("upstream {upstream} unreachable: {source}")]
    UpstreamUnreachable {
        upstream: String,
        #[source]
        source: BoxError,
    },

    /// The exchange exceeded its time budget.
    #[error("upstream {upstream} timed out after {elapsed_ms}ms")]
    UpstreamTimeout { upstream: String, elapsed_ms: u64 },

    /// The inbound request cannot be forwarded as sent.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Anything else that went wrong inside the forwarder.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub(crate) fn unreachable(upstream: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::UpstreamUnreachable {
            upstream: upstream.into(),
            source: source.into(),
        }
    }

    /// HTTP status surfaced to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ConfigurationConflict(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::ConfigurationConflict(_) => "configuration_conflict",
            ProxyError::UpstreamUnreachable { .. } => "upstream_unreachable",
            ProxyError::UpstreamTimeout { .. } => "upstream_timeout",
            ProxyError::MalformedRequest(_) => "malformed_request",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ProxyError::UpstreamUnreachable { .. } => "Upstream unreachable",
            ProxyError::UpstreamTimeout { .. } => "Upstream timed out",
            ProxyError::MalformedRequest(_) => "Malformed request",
            ProxyError::ConfigurationConflict(_) | ProxyError::Internal(_) => {
                "Internal proxy error"
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if matches!(self, ProxyError::MalformedRequest(_)) {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}
