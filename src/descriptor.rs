//! The request descriptor and its constituent types (§3).

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{factory, ErrorContext, Result};

/// HTTP method, restricted to the enumerated set (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

/// How to interpret the transport's response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResponseForm {
    #[default]
    Json,
    Text,
    Bytes,
    Stream,
}

/// Request body, one of the forms in §3. Streams are represented only by
/// their presence — this crate does not read transport bodies itself.
#[derive(Debug, Clone)]
pub enum Body {
    None,
    Text(String),
    Bytes(Vec<u8>),
    /// Ordered key-value form data.
    Form(Vec<(String, String)>),
    Stream,
    /// Arbitrary value, serialized by the transport per its own rules.
    Value(Value),
}

impl Default for Body {
    fn default() -> Self {
        Body::None
    }
}

/// A scalar parameter or header value. `Null` is dropped at fingerprint time.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    String(String),
    Number(f64),
    Bool(bool),
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

/// Per-call override for serial-queue admission, bound at first enqueue for
/// a key and ignored thereafter (§4.4 — "first wins, rest ignored").
#[derive(Debug, Clone, Default)]
pub struct SerialConfigOverride {
    pub max_queue_size: Option<usize>,
    pub queue_timeout: Option<Duration>,
}

/// Per-call override for cache behavior.
#[derive(Debug, Clone, Default)]
pub struct CacheConfigOverride {
    pub ttl: Option<Duration>,
    pub enabled: Option<bool>,
}

/// Opaque per-call bag; only `serial_config`/`cache_config` are inspected by
/// the pipeline, everything else passes through untouched (§9).
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub serial_config: Option<SerialConfigOverride>,
    pub cache_config: Option<CacheConfigOverride>,
    pub extra: Option<Value>,
}

/// Input to [`crate::pipeline::RequestPipeline::execute`].
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub id: Uuid,
    pub url: String,
    pub method: Method,
    pub params: BTreeMap<String, Scalar>,
    pub body: Body,
    /// Ordered, case-insensitive header mapping.
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub response_form: ResponseForm,
    pub serial_key: Option<String>,
    pub tag: Option<String>,
    pub metadata: Metadata,
    pub debug: bool,
    /// Caller-supplied cancel handle (§3). Forwarded into the internal
    /// abort controller a pipeline arms for this call (§4.9).
    pub abort_signal: Option<crate::cancellation::AbortSignal>,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>, method: Method) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            method,
            params: BTreeMap::new(),
            body: Body::None,
            headers: Vec::new(),
            timeout: Some(Duration::from_secs(10)),
            response_form: ResponseForm::default(),
            serial_key: None,
            tag: None,
            metadata: Metadata::default(),
            debug: false,
            abort_signal: None,
        }
    }

    pub fn with_abort_signal(mut self, signal: crate::cancellation::AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_serial_key(mut self, key: impl Into<String>) -> Self {
        self.serial_key = Some(key.into());
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Per-call serial-queue override, honored only if this is the first
    /// enqueue seen for the key (§4.4).
    pub fn with_serial_config(mut self, config: SerialConfigOverride) -> Self {
        self.metadata.serial_config = Some(config);
        self
    }

    /// Per-call cache override (TTL / enable-disable).
    pub fn with_cache_config(mut self, config: CacheConfigOverride) -> Self {
        self.metadata.cache_config = Some(config);
        self
    }

    /// Whether this descriptor should be routed into a serial queue.
    ///
    /// Open question resolved (§9): an *empty* `serialKey` string is treated
    /// as absent (bypasses the queue), rather than rejected. Only a
    /// genuinely `Some(non_empty)` value routes into C5. A caller wanting
    /// strict rejection of empty keys should validate before calling
    /// `execute` — the pipeline's job is routing, not policing intent.
    pub fn effective_serial_key(&self) -> Option<&str> {
        self.serial_key
            .as_deref()
            .filter(|key| !key.is_empty())
    }

    /// Validate per §4.1 step 1.
    pub fn validate(&self) -> Result<()> {
        let ctx = || ErrorContext::new().with_url(self.url.clone()).with_method(self.method.as_str());

        if self.url.trim().is_empty() {
            return Err(factory::validation("url must be a non-empty string", ctx())
                .with_suggestion("provide a non-empty `url`")
                .with_code("INVALID_URL"));
        }

        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(factory::validation("timeout must be positive", ctx())
                    .with_suggestion("omit `timeout` or set it to a positive duration")
                    .with_code("INVALID_TIMEOUT"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_url() {
        let desc = RequestDescriptor::new("", Method::Get);
        let err = desc.validate().unwrap_err();
        assert_eq!(err.code, Some("INVALID_URL"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let desc = RequestDescriptor::new("/x", Method::Get).with_timeout(Duration::ZERO);
        let err = desc.validate().unwrap_err();
        assert_eq!(err.code, Some("INVALID_TIMEOUT"));
    }

    #[test]
    fn empty_serial_key_is_treated_as_absent() {
        let desc = RequestDescriptor::new("/x", Method::Get).with_serial_key("");
        assert_eq!(desc.effective_serial_key(), None);
    }

    #[test]
    fn non_empty_serial_key_routes_to_queue() {
        let desc = RequestDescriptor::new("/x", Method::Get).with_serial_key("user-42");
        assert_eq!(desc.effective_serial_key(), Some("user-42"));
    }

    #[test]
    fn valid_descriptor_passes() {
        let desc = RequestDescriptor::new("/ok", Method::Post);
        assert!(desc.validate().is_ok());
    }
}
