//! Owns one [`SerialQueue`] per key (C5, §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::queue::{SerialConfig, SerialQueue, SerialQueueStats, TaskRunner};
use crate::error::{factory, ErrorContext, Result};

/// A queue lifecycle transition, broadcast for observability (grounded in
/// `InMemoryRequestManager::get_status_updates` / `status_tx`). Purely
/// in-process — no distributed coordination.
#[derive(Debug, Clone)]
pub enum SerialQueueEvent {
    Created { key: String },
    Removed { key: String },
}

#[derive(Clone)]
pub struct SerialManagerConfig {
    /// Upper bound on distinct keys tracked at once; `None` is unbounded.
    pub max_queues: Option<usize>,
    /// Default per-queue config applied when a key has no override.
    pub default_queue_config: SerialConfig,
    /// How often idle, empty queues are reaped. `None` disables reaping.
    pub cleanup_interval: Option<Duration>,
}

impl Default for SerialManagerConfig {
    fn default() -> Self {
        Self {
            max_queues: None,
            default_queue_config: SerialConfig::default(),
            cleanup_interval: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SerialManagerStats {
    pub queue_count: usize,
    pub total_pending: usize,
    pub per_queue: HashMap<String, SerialQueueStats>,
}

struct ManagerState {
    queues: HashMap<String, Arc<SerialQueue>>,
    destroyed: bool,
}

/// Routes descriptors to a per-key [`SerialQueue`], creating queues lazily
/// and reaping idle ones on a timer (§4.4).
///
/// The first caller to touch a given key decides that queue's
/// [`SerialConfig`] — later overrides for the same key are ignored, which
/// matches the "first enqueue wins" invariant called out in §4.4 and §9.
pub struct SerialManager {
    state: Arc<Mutex<ManagerState>>,
    config: SerialManagerConfig,
    runner: TaskRunner,
    cleanup: Option<tokio::task::JoinHandle<()>>,
    events: tokio::sync::broadcast::Sender<SerialQueueEvent>,
}

impl SerialManager {
    pub fn new(config: SerialManagerConfig, runner: TaskRunner) -> Self {
        let state = Arc::new(Mutex::new(ManagerState {
            queues: HashMap::new(),
            destroyed: false,
        }));
        let (events, _) = tokio::sync::broadcast::channel(64);

        let cleanup = config.cleanup_interval.map(|interval| {
            let state = state.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let mut s = state.lock();
                    if s.destroyed {
                        break;
                    }
                    s.queues.retain(|_, queue| !queue.is_idle());
                }
            })
        });

        Self {
            state,
            config,
            runner,
            cleanup,
            events,
        }
    }

    /// Subscribe to queue creation/removal events. Purely in-process
    /// observability — dropping the receiver is safe at any time.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SerialQueueEvent> {
        self.events.subscribe()
    }

    /// Enqueue `descriptor` onto the queue for `key`, creating it (with
    /// `override_config` if this is the first call for `key`) if needed.
    pub fn enqueue(
        &self,
        key: &str,
        descriptor: crate::descriptor::RequestDescriptor,
        override_config: Option<SerialConfig>,
    ) -> Result<tokio::sync::oneshot::Receiver<Result<crate::transport::TransportValue>>> {
        let queue = self.get_or_create_queue(key, override_config)?;
        queue.enqueue(descriptor)
    }

    fn get_or_create_queue(&self, key: &str, override_config: Option<SerialConfig>) -> Result<Arc<SerialQueue>> {
        let mut s = self.state.lock();
        if s.destroyed {
            return Err(factory::validation("serial manager destroyed", ErrorContext::new()));
        }

        if let Some(existing) = s.queues.get(key) {
            return Ok(existing.clone());
        }

        if let Some(max) = self.config.max_queues {
            if s.queues.len() >= max {
                return Err(factory::validation(
                    format!("Maximum number of serial queues ({max}) reached"),
                    ErrorContext::new(),
                )
                .with_code("SERIAL_MANAGER_FULL"));
            }
        }

        let cfg = override_config.unwrap_or_else(|| self.config.default_queue_config.clone());
        let queue = Arc::new(SerialQueue::new(key, cfg, self.runner.clone()));
        s.queues.insert(key.to_string(), queue.clone());
        let _ = self.events.send(SerialQueueEvent::Created { key: key.to_string() });
        Ok(queue)
    }

    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }

    pub fn has(&self, key: &str) -> bool {
        self.state.lock().queues.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().queues.keys().cloned().collect()
    }

    /// Reject every task waiting on `key`'s queue, leaving the queue itself
    /// (and any task currently executing on it) intact.
    pub fn clear(&self, key: &str) {
        if let Some(queue) = self.state.lock().queues.get(key) {
            queue.clear();
        }
    }

    /// Clear every managed queue.
    pub fn clear_all(&self) {
        for queue in self.state.lock().queues.values() {
            queue.clear();
        }
    }

    /// Destroy and drop the queue for `key`, if one exists. A later enqueue
    /// for the same key creates a fresh queue, free to bind a new config.
    pub fn remove(&self, key: &str) {
        if let Some(queue) = self.state.lock().queues.remove(key) {
            queue.destroy();
            let _ = self.events.send(SerialQueueEvent::Removed { key: key.to_string() });
        }
    }

    /// Reap queues that are idle (no waiters, not executing). Exposed for
    /// callers that want an immediate sweep outside the timer in
    /// [`SerialManagerConfig::cleanup_interval`].
    pub fn cleanup(&self) {
        self.state.lock().queues.retain(|_, queue| !queue.is_idle());
    }

    pub fn stats(&self) -> SerialManagerStats {
        let s = self.state.lock();
        let mut per_queue = HashMap::new();
        let mut total_pending = 0;
        for (key, queue) in s.queues.iter() {
            let stats = queue.stats();
            total_pending += stats.pending;
            per_queue.insert(key.clone(), stats);
        }
        SerialManagerStats {
            queue_count: s.queues.len(),
            total_pending,
            per_queue,
        }
    }

    /// Destroy every managed queue and stop accepting new ones.
    pub fn destroy(&self) {
        let mut s = self.state.lock();
        s.destroyed = true;
        for queue in s.queues.values() {
            queue.destroy();
        }
        s.queues.clear();
        if let Some(handle) = &self.cleanup {
            handle.abort();
        }
    }
}

impl Drop for SerialManager {
    fn drop(&mut self) {
        if let Some(handle) = &self.cleanup {
            handle.abort();
        }
    }
}
