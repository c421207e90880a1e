//! One queue, one key, one worker (C4, §4.3).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use crate::descriptor::RequestDescriptor;
use crate::error::{factory, ErrorContext, Result};
use crate::transport::TransportValue;

/// What a `SerialQueue` calls to actually run a dequeued descriptor — the
/// pipeline supplies this as a closure over its interceptor chain and
/// transport, keeping the queue itself transport-agnostic.
pub type TaskRunner = Arc<
    dyn Fn(RequestDescriptor) -> Pin<Box<dyn Future<Output = Result<TransportValue>> + Send>>
        + Send
        + Sync,
>;

/// Per-queue admission and callback configuration, bound at the queue's
/// creation and never replaced afterward (§4.4 — "first wins, rest
/// ignored", enforced by [`super::manager::SerialManager`]).
#[derive(Clone)]
pub struct SerialConfig {
    pub capacity: Option<usize>,
    pub queue_timeout: Option<Duration>,
    pub on_queue_full: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_task_timeout: Option<Arc<dyn Fn(&SerialTaskInfo) + Send + Sync>>,
    pub debug: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            queue_timeout: None,
            on_queue_full: None,
            on_task_timeout: None,
            debug: false,
        }
    }
}

impl std::fmt::Debug for SerialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConfig")
            .field("capacity", &self.capacity)
            .field("queue_timeout", &self.queue_timeout)
            .field("debug", &self.debug)
            .finish()
    }
}

/// Read-only view of a task handed to `on_task_timeout`.
#[derive(Debug, Clone)]
pub struct SerialTaskInfo {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SerialQueueStats {
    pub total_tasks: u64,
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_processing_ms: f64,
    pub is_processing: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
}

struct PendingTask {
    id: Uuid,
    descriptor: RequestDescriptor,
    enqueued_at: tokio::time::Instant,
    created_at: DateTime<Utc>,
    responder: oneshot::Sender<Result<TransportValue>>,
}

struct SharedState {
    pending: VecDeque<PendingTask>,
    executing: bool,
    total_tasks: u64,
    completed: u64,
    failed: u64,
    total_processing_ms: f64,
    last_processed_at: Option<DateTime<Utc>>,
    destroyed: bool,
}

/// FIFO, single-worker queue bound to one key (§4.3).
///
/// Tasks run strictly one at a time — the next transport call begins only
/// after the previous one has settled (§5 ordering guarantees). Backed by a
/// plain `VecDeque` under a `parking_lot::Mutex` (the teacher's synchronous
/// critical-section style, `fusillade/src/daemon/mod.rs`) rather than an
/// mpsc channel, so `clear()` can reject waiting tasks in place instead of
/// racing a channel drain.
pub struct SerialQueue {
    key: String,
    config: SerialConfig,
    state: Arc<Mutex<SharedState>>,
    notify: Arc<Notify>,
    worker: tokio::task::JoinHandle<()>,
}

impl SerialQueue {
    pub fn new(key: impl Into<String>, config: SerialConfig, runner: TaskRunner) -> Self {
        let state = Arc::new(Mutex::new(SharedState {
            pending: VecDeque::new(),
            executing: false,
            total_tasks: 0,
            completed: 0,
            failed: 0,
            total_processing_ms: 0.0,
            last_processed_at: None,
            destroyed: false,
        }));
        let notify = Arc::new(Notify::new());

        let worker_state = state.clone();
        let worker_config = config.clone();
        let worker_notify = notify.clone();
        let worker = tokio::spawn(async move {
            loop {
                let task = {
                    let mut s = worker_state.lock();
                    if s.destroyed {
                        return;
                    }
                    s.pending.pop_front()
                };

                let task = match task {
                    Some(task) => task,
                    None => {
                        worker_notify.notified().await;
                        continue;
                    }
                };

                if let Some(queue_timeout) = worker_config.queue_timeout {
                    if task.enqueued_at.elapsed() >= queue_timeout {
                        if let Some(cb) = &worker_config.on_task_timeout {
                            cb(&SerialTaskInfo {
                                id: task.id,
                                created_at: task.created_at,
                            });
                        }
                        let err = factory::timeout_error(
                            "Serial task exceeded queue_timeout before dequeue",
                            ErrorContext::new(),
                        )
                        .with_code("SERIAL_TASK_TIMEOUT");
                        let _ = task.responder.send(Err(err));
                        let mut s = worker_state.lock();
                        s.failed += 1;
                        continue;
                    }
                }

                {
                    let mut s = worker_state.lock();
                    s.executing = true;
                }

                let started = tokio::time::Instant::now();
                let result = runner(task.descriptor).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

                {
                    let mut s = worker_state.lock();
                    s.executing = false;
                    s.total_tasks += 1;
                    s.total_processing_ms += elapsed_ms;
                    s.last_processed_at = Some(Utc::now());
                    if result.is_ok() {
                        s.completed += 1;
                    } else {
                        s.failed += 1;
                    }
                }

                let _ = task.responder.send(result);
            }
        });

        Self {
            key: key.into(),
            config,
            state,
            notify,
            worker,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enqueue a descriptor, deep-copying it so later mutation of the
    /// caller's original has no effect on execution (Rust's `Clone`
    /// semantics give us this for free — there is no shared backing buffer
    /// to alias).
    pub fn enqueue(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<oneshot::Receiver<Result<TransportValue>>> {
        let mut s = self.state.lock();
        if s.destroyed {
            return Err(factory::validation("serial queue destroyed", ErrorContext::new()));
        }

        if let Some(capacity) = self.config.capacity {
            let in_flight = s.pending.len() + usize::from(s.executing);
            if in_flight >= capacity {
                if let Some(cb) = &self.config.on_queue_full {
                    cb(&self.key);
                }
                return Err(factory::validation(
                    format!("serial queue '{}' is full (capacity {capacity})", self.key),
                    ErrorContext::new(),
                )
                .with_code("SERIAL_QUEUE_FULL"));
            }
        }

        let (responder, rx) = oneshot::channel();
        let task = PendingTask {
            id: Uuid::new_v4(),
            descriptor,
            enqueued_at: tokio::time::Instant::now(),
            created_at: Utc::now(),
            responder,
        };
        s.pending.push_back(task);
        drop(s);
        self.notify.notify_one();
        Ok(rx)
    }

    pub fn length(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let s = self.state.lock();
        s.pending.is_empty() && !s.executing
    }

    /// Reject every currently waiting task with `SERIAL_QUEUE_CLEARED`; a
    /// task already executing completes normally (§4.3).
    pub fn clear(&self) {
        let mut s = self.state.lock();
        let rejected: Vec<_> = s.pending.drain(..).collect();
        drop(s);
        for task in rejected {
            let err = factory::validation("serial queue cleared", ErrorContext::new())
                .with_code("SERIAL_QUEUE_CLEARED");
            let _ = task.responder.send(Err(err));
        }
    }

    pub fn stats(&self) -> SerialQueueStats {
        let s = self.state.lock();
        let settled = s.completed + s.failed;
        let avg = if settled > 0 {
            s.total_processing_ms / settled as f64
        } else {
            0.0
        };
        SerialQueueStats {
            total_tasks: s.total_tasks,
            pending: s.pending.len(),
            completed: s.completed,
            failed: s.failed,
            avg_processing_ms: avg,
            is_processing: s.executing,
            last_processed_at: s.last_processed_at,
        }
    }

    /// Reject all waiters, stop accepting new tasks, and shut down the
    /// worker. A task already executing is abandoned mid-flight along with
    /// the worker task itself.
    pub fn destroy(&self) {
        self.clear();
        let mut s = self.state.lock();
        s.destroyed = true;
        drop(s);
        self.notify.notify_waiters();
        self.worker.abort();
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_runner() -> TaskRunner {
        Arc::new(|desc: RequestDescriptor| {
            Box::pin(async move { Ok(TransportValue::Text(desc.url.clone())) })
        })
    }

    #[tokio::test]
    async fn tasks_execute_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let runner: TaskRunner = Arc::new(move |desc: RequestDescriptor| {
            let order = order_clone.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                order.lock().push(desc.url.clone());
                Ok(TransportValue::Text(desc.url))
            })
        });

        let queue = SerialQueue::new("k", SerialConfig::default(), runner);
        let rx_a = queue.enqueue(RequestDescriptor::new("/a", Method::Get)).unwrap();
        let rx_b = queue.enqueue(RequestDescriptor::new("/b", Method::Get)).unwrap();
        let rx_c = queue.enqueue(RequestDescriptor::new("/c", Method::Get)).unwrap();

        rx_a.await.unwrap().unwrap();
        rx_b.await.unwrap().unwrap();
        rx_c.await.unwrap().unwrap();

        assert_eq!(*order.lock(), vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn capacity_rejects_synchronously_when_full() {
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(Some(gate_rx)));
        let runner: TaskRunner = Arc::new(move |_desc| {
            let gate_rx = gate_rx.clone();
            Box::pin(async move {
                if let Some(rx) = gate_rx.lock().take() {
                    let _ = rx.await;
                }
                Ok(TransportValue::Text("done".to_string()))
            })
        });

        let full_calls = Arc::new(AtomicUsize::new(0));
        let full_calls_clone = full_calls.clone();
        let config = SerialConfig {
            capacity: Some(1),
            on_queue_full: Some(Arc::new(move |_key| {
                full_calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };

        let queue = SerialQueue::new("k", config, runner);
        let _first = queue.enqueue(RequestDescriptor::new("/a", Method::Get)).unwrap();

        // Give the worker a moment to pick up the first task so it's "executing".
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = queue.enqueue(RequestDescriptor::new("/b", Method::Get));
        assert!(second.is_err());
        assert_eq!(second.unwrap_err().code, Some("SERIAL_QUEUE_FULL"));
        assert_eq!(full_calls.load(Ordering::SeqCst), 1);

        let _ = gate_tx.send(());
    }

    #[tokio::test]
    async fn failure_does_not_halt_the_queue() {
        let runner: TaskRunner = Arc::new(|desc: RequestDescriptor| {
            Box::pin(async move {
                if desc.url == "/fail" {
                    Err(factory::network_error("boom", ErrorContext::new()))
                } else {
                    Ok(TransportValue::Text(desc.url))
                }
            })
        });

        let queue = SerialQueue::new("k", SerialConfig::default(), runner);
        let rx1 = queue.enqueue(RequestDescriptor::new("/fail", Method::Get)).unwrap();
        let rx2 = queue.enqueue(RequestDescriptor::new("/ok", Method::Get)).unwrap();

        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_ok());

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn is_idle_reflects_pending_and_executing() {
        let queue = SerialQueue::new("k", SerialConfig::default(), echo_runner());
        assert!(queue.is_idle());
        let rx = queue.enqueue(RequestDescriptor::new("/a", Method::Get)).unwrap();
        rx.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn clear_rejects_waiting_tasks_but_not_the_executing_one() {
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(Some(gate_rx)));
        let runner: TaskRunner = Arc::new(move |desc: RequestDescriptor| {
            let gate_rx = gate_rx.clone();
            Box::pin(async move {
                if desc.url == "/first" {
                    if let Some(rx) = gate_rx.lock().take() {
                        let _ = rx.await;
                    }
                }
                Ok(TransportValue::Text(desc.url))
            })
        });

        let queue = SerialQueue::new("k", SerialConfig::default(), runner);
        let rx_first = queue.enqueue(RequestDescriptor::new("/first", Method::Get)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rx_second = queue.enqueue(RequestDescriptor::new("/second", Method::Get)).unwrap();

        queue.clear();
        let second_result = rx_second.await.unwrap();
        assert_eq!(second_result.unwrap_err().code, Some("SERIAL_QUEUE_CLEARED"));

        let _ = gate_tx.send(());
        let first_result = rx_first.await.unwrap();
        assert!(first_result.is_ok());
    }
}
