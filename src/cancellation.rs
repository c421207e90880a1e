//! Timeout arming and abort-signal merging (§4.9, §5).
//!
//! Each `execute` call creates one internal [`tokio_util::sync::CancellationToken`].
//! A timer armed at the descriptor's timeout cancels it; if the caller
//! supplied its own signal, cancelling that forwards into the same token.
//! The merged token is what gets handed to the `Transport`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::descriptor::RequestDescriptor;
use crate::error::{factory, ErrorContext, RequestError};

/// A caller-supplied cancel handle (`abortSignal` in §3).
pub type AbortSignal = CancellationToken;

/// Tracks why the merged token fired, so the pipeline can pick the right
/// `TIMEOUT` message per §4.9.
pub struct ArmedTimeout {
    pub token: CancellationToken,
    timer: tokio::task::JoinHandle<()>,
    timed_out: std::sync::Arc<std::sync::atomic::AtomicBool>,
    caller_signal: Option<AbortSignal>,
}

impl ArmedTimeout {
    /// Arm a merged cancellation token for one `execute` call.
    ///
    /// `timeout` is clamped the same way batch timeouts are (§4.2) to avoid
    /// overflowing the platform timer representation.
    pub fn arm(timeout: Duration, caller_signal: Option<AbortSignal>) -> Self {
        const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);
        let timeout = timeout.min(MAX_TIMEOUT);

        let token = CancellationToken::new();
        let timed_out = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        if let Some(ref caller) = caller_signal {
            let child = token.clone();
            let caller = caller.clone();
            tokio::spawn(async move {
                caller.cancelled().await;
                child.cancel();
            });
        }

        let timer_token = token.clone();
        let timer_flag = timed_out.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            timer_token.cancel();
        });

        Self {
            token,
            timer,
            timed_out,
            caller_signal,
        }
    }

    /// Stop the timer; call this as soon as the guarded operation settles so
    /// an already-completed call doesn't later get flagged `timed_out`.
    pub fn disarm(&self) {
        self.timer.abort();
    }

    /// Translate an abort into the correct `TIMEOUT` error, distinguishing
    /// an internal timer firing from a caller-initiated abort (§4.9).
    pub fn translate_abort(&self, descriptor: &RequestDescriptor, duration_ms: u128) -> RequestError {
        let ctx = ErrorContext::new()
            .with_url(&descriptor.url)
            .with_method(descriptor.method.as_str());

        let caller_aborted = self
            .caller_signal
            .as_ref()
            .map(|s| s.is_cancelled())
            .unwrap_or(false);

        if caller_aborted && !self.timed_out.load(std::sync::atomic::Ordering::SeqCst) {
            factory::timeout_error("Request aborted", ctx)
        } else {
            factory::timeout_error(format!("Request timeout after {duration_ms}ms"), ctx)
        }
    }
}

impl Drop for ArmedTimeout {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Error produced when a transport call observes cancellation directly
/// (used by [`crate::transport::MockTransport`] and any real transport).
pub fn aborted_error(descriptor: &RequestDescriptor) -> RequestError {
    factory::timeout_error(
        "Request aborted",
        ErrorContext::new()
            .with_url(&descriptor.url)
            .with_method(descriptor.method.as_str()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Method;

    #[tokio::test]
    async fn timer_fires_and_cancels_token() {
        let armed = ArmedTimeout::arm(Duration::from_millis(20), None);
        armed.token.cancelled().await;
        assert!(armed.timed_out.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn caller_abort_is_distinguished_from_timeout() {
        let caller = CancellationToken::new();
        let armed = ArmedTimeout::arm(Duration::from_secs(30), Some(caller.clone()));
        caller.cancel();
        armed.token.cancelled().await;
        armed.disarm();

        let desc = RequestDescriptor::new("/x", Method::Get);
        let err = armed.translate_abort(&desc, 5);
        assert!(err.message.contains("aborted"));
    }

    #[tokio::test]
    async fn internal_timer_message_contains_duration() {
        let armed = ArmedTimeout::arm(Duration::from_millis(10), None);
        armed.token.cancelled().await;
        let desc = RequestDescriptor::new("/x", Method::Get);
        let err = armed.translate_abort(&desc, 150);
        assert!(err.message.contains("150ms"));
    }
}
