//! Shared error taxonomy for the request runtime (component C10 / §4.9).
//!
//! Every public operation in this crate surfaces a single [`RequestError`];
//! nothing bubbles up a foreign error type, and nothing double-wraps one
//! that has already been classified.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, RequestError>;

/// The closed set of error classifications.
///
/// Mapping rules (§7): user input problems are `Validation`; transport
/// timeouts and caller aborts are `Timeout`; a non-OK HTTP response is
/// `Http`; connectivity failures are `Network`; cache-layer misbehavior is
/// `Cache`; executor/queue admission problems are `Validation` or
/// `Concurrent`; everything else wrapped from a foreign error is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Http,
    Timeout,
    Validation,
    Cache,
    Concurrent,
    Retry,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Http => "HTTP",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Cache => "CACHE",
            ErrorKind::Concurrent => "CONCURRENT",
            ErrorKind::Retry => "RETRY",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Context carried on every [`RequestError`], enough to drive logging and
/// retry decisions without re-deriving it from the descriptor.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub url: Option<String>,
    pub method: Option<String>,
    pub tag: Option<String>,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub duration: Option<Duration>,
    pub metadata: Option<Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            timestamp: Some(chrono::Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// The unified error type returned by every public operation in this crate.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// Stable machine-readable code (e.g. `SERIAL_QUEUE_FULL`), distinct
    /// from `kind`, for callers that branch on specific failure modes.
    pub code: Option<&'static str>,
    /// Free-form remediation hint surfaced on validation failures.
    pub suggestion: Option<String>,
    pub context: ErrorContext,
    #[source]
    pub cause: Option<std::sync::Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl RequestError {
    fn new(kind: ErrorKind, message: impl Into<String>, context: ErrorContext) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: None,
            suggestion: None,
            context,
            cause: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(std::sync::Arc::new(cause));
        self
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

/// Pure factory functions constructing the canonical errors (§4.9). Kept as
/// free functions rather than a stateful type — there is nothing to own.
pub mod factory {
    use super::*;

    pub fn validation(message: impl Into<String>, context: ErrorContext) -> RequestError {
        RequestError::new(ErrorKind::Validation, message, context)
    }

    pub fn http_error(status: u16, message: impl Into<String>, context: ErrorContext) -> RequestError {
        let mut err = RequestError::new(ErrorKind::Http, message, context);
        err.status = Some(status);
        err
    }

    pub fn timeout_error(message: impl Into<String>, context: ErrorContext) -> RequestError {
        RequestError::new(ErrorKind::Timeout, message, context)
    }

    pub fn network_error(message: impl Into<String>, context: ErrorContext) -> RequestError {
        RequestError::new(ErrorKind::Network, message, context)
    }

    pub fn cache_error(message: impl Into<String>, context: ErrorContext) -> RequestError {
        RequestError::new(ErrorKind::Cache, message, context)
    }

    pub fn concurrent_error(message: impl Into<String>, context: ErrorContext) -> RequestError {
        RequestError::new(ErrorKind::Concurrent, message, context)
    }

    /// Wrap an arbitrary foreign error, preserving its message and storing
    /// it as `cause`, exactly once (callers must not wrap an already-wrapped
    /// `RequestError`).
    pub fn wrap_error(
        err: impl std::error::Error + Send + Sync + 'static,
        context: ErrorContext,
    ) -> RequestError {
        let message = err.to_string();
        let mut wrapped = RequestError::new(ErrorKind::Unknown, message, context);
        wrapped.cause = Some(std::sync::Arc::new(err));
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = factory::validation("url is required", ErrorContext::new());
        let rendered = err.to_string();
        assert!(rendered.contains("VALIDATION"));
        assert!(rendered.contains("url is required"));
    }

    #[test]
    fn http_error_carries_status() {
        let err = factory::http_error(404, "not found", ErrorContext::new());
        assert_eq!(err.status, Some(404));
        assert_eq!(err.kind, ErrorKind::Http);
    }

    #[test]
    fn wrap_error_preserves_message_and_cause() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let wrapped = factory::wrap_error(Boom, ErrorContext::new());
        assert_eq!(wrapped.kind, ErrorKind::Unknown);
        assert_eq!(wrapped.message, "boom");
        assert!(wrapped.cause.is_some());
    }

    #[test]
    fn code_is_distinguishable_from_kind() {
        let err = factory::validation("queue is full", ErrorContext::new())
            .with_code("SERIAL_QUEUE_FULL");
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.code, Some("SERIAL_QUEUE_FULL"));
    }
}
