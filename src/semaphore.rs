//! Bounded permit pool with FIFO waiters and timed acquisition (C1, §4.5).
//!
//! `tokio::sync::Semaphore` is a fine building block but doesn't expose a
//! waiter count or a destroy-with-rejection path, both of which the spec
//! requires, so this rolls its own waiter queue guarded by a
//! `parking_lot::Mutex` — the same synchronous-critical-section style the
//! teacher uses for `daemon::Daemon::semaphores` (`RwLock<HashMap<String,
//! Arc<Semaphore>>>` in `fusillade/src/daemon/mod.rs`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{factory, ErrorContext, Result};

/// Design value from §4.5: an acquire not served within this long is
/// rejected and swept away.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(30);
/// Design value from §4.5: defense-in-depth sweep interval for waiters
/// whose own timer was somehow missed.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct Waiter {
    id: u64,
    responder: oneshot::Sender<WaiterOutcome>,
    enqueued_at: tokio::time::Instant,
}

enum WaiterOutcome {
    Granted,
    TimedOut,
    Destroyed,
}

struct Inner {
    available: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    destroyed: bool,
}

/// A held permit. Dropping it releases capacity back to the semaphore
/// exactly once — re-entrant release is not supported (§4.5).
pub struct Permit {
    semaphore: Arc<SemaphoreState>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

struct SemaphoreState {
    inner: Mutex<Inner>,
}

impl SemaphoreState {
    fn release(&self) {
        let mut inner = self.inner.lock();
        loop {
            match inner.waiters.pop_front() {
                Some(waiter) => {
                    // Wake the oldest waiter; if it already gave up (its
                    // receiver dropped), move on to the next one instead of
                    // leaking the permit.
                    if waiter.responder.send(WaiterOutcome::Granted).is_ok() {
                        return;
                    }
                }
                None => {
                    inner.available += 1;
                    return;
                }
            }
        }
    }
}

/// Bounded concurrency primitive (§4.5).
pub struct Semaphore {
    state: Arc<SemaphoreState>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new(SemaphoreState {
                inner: Mutex::new(Inner {
                    available: permits,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    destroyed: false,
                }),
            }),
        }
    }

    /// Acquire one permit, waiting FIFO if none are immediately available.
    /// Rejects with `TIMEOUT` if not served within [`MAX_WAIT_TIME`].
    pub async fn acquire(&self) -> Result<Permit> {
        let (id, rx) = {
            let mut inner = self.state.inner.lock();
            if inner.destroyed {
                return Err(destroyed_error());
            }
            if inner.available > 0 {
                inner.available -= 1;
                return Ok(Permit {
                    semaphore: self.state.clone(),
                });
            }
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter {
                id,
                responder: tx,
                enqueued_at: tokio::time::Instant::now(),
            });
            (id, rx)
        };

        match tokio::time::timeout(MAX_WAIT_TIME, rx).await {
            Ok(Ok(WaiterOutcome::Granted)) => Ok(Permit {
                semaphore: self.state.clone(),
            }),
            Ok(Ok(WaiterOutcome::Destroyed)) => Err(destroyed_error()),
            Ok(Ok(WaiterOutcome::TimedOut)) => Err(wait_timeout_error()),
            Err(_) => {
                // Our own timer fired before a responder ever ran; the
                // waiter is still sitting in the queue, so remove it
                // ourselves instead of leaving it for `release()` to skip
                // past later.
                self.state.inner.lock().waiters.retain(|w| w.id != id);
                Err(wait_timeout_error())
            }
            Ok(Err(_)) => Err(destroyed_error()),
        }
    }

    pub fn available(&self) -> usize {
        self.state.inner.lock().available
    }

    pub fn waiting_count(&self) -> usize {
        self.state.inner.lock().waiters.len()
    }

    /// Defense-in-depth sweep: reject any waiter older than
    /// [`MAX_WAIT_TIME`], in case its own per-waiter timeout was missed
    /// (e.g. the runtime was starved). Intended to run on [`SWEEP_INTERVAL`].
    pub fn sweep_stale_waiters(&self) {
        let mut inner = self.state.inner.lock();
        let now = tokio::time::Instant::now();
        inner.waiters.retain_mut(|waiter| {
            if now.duration_since(waiter.enqueued_at) >= MAX_WAIT_TIME {
                let (tx, _) = oneshot::channel();
                let stale = std::mem::replace(&mut waiter.responder, tx);
                let _ = stale.send(WaiterOutcome::TimedOut);
                false
            } else {
                true
            }
        });
    }

    /// Reject every waiter and pin `available()` at zero (§4.5, §5).
    pub fn destroy(&self) {
        let mut inner = self.state.inner.lock();
        inner.destroyed = true;
        inner.available = 0;
        while let Some(waiter) = inner.waiters.pop_front() {
            let _ = waiter.responder.send(WaiterOutcome::Destroyed);
        }
    }
}

fn wait_timeout_error() -> crate::error::RequestError {
    factory::timeout_error(
        format!("Semaphore acquire timed out after {}ms", MAX_WAIT_TIME.as_millis()),
        ErrorContext::new(),
    )
}

fn destroyed_error() -> crate::error::RequestError {
    factory::concurrent_error("Semaphore destroyed", ErrorContext::new())
}
