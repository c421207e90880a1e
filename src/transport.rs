//! The `Transport` capability (§6) and a mock test double.
//!
//! Issuing a request is explicitly out of scope for this crate (§1) — it is
//! delegated to an injected `Transport`. Everything else in the crate
//! orchestrates calls through this one narrow seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::descriptor::RequestDescriptor;
use crate::error::Result;

/// Raw value returned by a transport call, already shaped per
/// `descriptor.response_form`. The pipeline treats this opaquely.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportValue {
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

/// External capability: send one request, return its body or fail.
///
/// Implementations must treat `descriptor.timeout` as a hint only (the
/// pipeline enforces the authoritative timeout via the merged abort signal),
/// respect `abort_signal`, and filter null/missing params at the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        descriptor: &RequestDescriptor,
        abort_signal: tokio_util::sync::CancellationToken,
    ) -> Result<TransportValue>;
}

/// A canned response, optionally gated behind a one-shot trigger so tests
/// can control exactly when a transport call resolves.
enum Canned {
    Immediate(Result<TransportValue>),
    Delayed(Duration, Result<TransportValue>),
    Triggered(tokio::sync::oneshot::Receiver<()>, Result<TransportValue>),
}

/// In-memory `Transport` double for tests, grounded in the teacher's
/// `MockHttpClient` (`batcher/src/http.rs`): responses are keyed by
/// `METHOD path`, consumed FIFO, and every call is recorded for assertions.
#[derive(Clone)]
pub struct MockTransport {
    responses: Arc<Mutex<HashMap<String, Vec<Canned>>>>,
    calls: Arc<Mutex<Vec<RequestDescriptor>>>,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    fn key(method: &str, url: &str) -> String {
        format!("{method} {url}")
    }

    pub fn add_response(&self, method: &str, url: &str, response: Result<TransportValue>) {
        self.responses
            .lock()
            .entry(Self::key(method, url))
            .or_default()
            .push(Canned::Immediate(response));
    }

    pub fn add_delayed_response(
        &self,
        method: &str,
        url: &str,
        delay: Duration,
        response: Result<TransportValue>,
    ) {
        self.responses
            .lock()
            .entry(Self::key(method, url))
            .or_default()
            .push(Canned::Delayed(delay, response));
    }

    /// Register a response that only resolves once the returned sender is
    /// fired, for deterministic concurrency tests (§8 scenario 4).
    pub fn add_triggered_response(
        &self,
        method: &str,
        url: &str,
        response: Result<TransportValue>,
    ) -> tokio::sync::oneshot::Sender<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.responses
            .lock()
            .entry(Self::key(method, url))
            .or_default()
            .push(Canned::Triggered(rx, response));
        tx
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<RequestDescriptor> {
        self.calls.lock().clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        descriptor: &RequestDescriptor,
        abort_signal: tokio_util::sync::CancellationToken,
    ) -> Result<TransportValue> {
        self.calls.lock().push(descriptor.clone());
        self.in_flight.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let _guard = scopeguard::guard(&self.in_flight, |flight| {
            flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        });

        let key = Self::key(descriptor.method.as_str(), &descriptor.url);
        let canned = {
            let mut responses = self.responses.lock();
            responses.get_mut(&key).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };

        match canned {
            Some(Canned::Immediate(result)) => result,
            Some(Canned::Delayed(delay, result)) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => result,
                    _ = abort_signal.cancelled() => Err(crate::cancellation::aborted_error(descriptor)),
                }
            }
            Some(Canned::Triggered(rx, result)) => {
                tokio::select! {
                    _ = rx => result,
                    _ = abort_signal.cancelled() => Err(crate::cancellation::aborted_error(descriptor)),
                }
            }
            None => Err(crate::error::factory::network_error(
                format!("no mock response configured for {key}"),
                crate::error::ErrorContext::new().with_url(&descriptor.url),
            )),
        }
    }
}
