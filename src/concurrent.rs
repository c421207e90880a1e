//! Bounded-parallelism batch execution over a set of descriptors (C6, §4.2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::collector::ResultCollector;
use crate::descriptor::RequestDescriptor;
use crate::error::{factory, ErrorContext, Result};
use crate::semaphore::Semaphore;
use crate::serial::TaskRunner;

const MAX_BATCH_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);

/// Per-call batch configuration (§4.2).
#[derive(Clone, Default)]
pub struct ConcurrentConfig {
    /// `None` or `>= descriptor count` dispatches every task immediately.
    pub max_concurrency: Option<usize>,
    pub fail_fast: bool,
    /// Whole-batch deadline, independent of any per-request timeout.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrentStats {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrency_used: usize,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// One descriptor's outcome within a batch.
#[derive(Clone)]
pub struct TaskOutcome {
    pub index: usize,
    pub result: Result<crate::transport::TransportValue>,
    /// Measured from permit acquisition, not from enqueue (§4.2).
    pub duration: Duration,
}

/// Runs batches of descriptors with bounded parallelism (§4.2).
///
/// Transport-agnostic: like [`crate::serial::SerialQueue`], it is handed a
/// [`TaskRunner`] closure (the pipeline's interceptor-wrapped transport
/// call) rather than owning a `Transport` itself.
pub struct ConcurrentExecutor {
    runner: TaskRunner,
}

impl ConcurrentExecutor {
    pub fn new(runner: TaskRunner) -> Self {
        Self { runner }
    }

    /// Run `descriptors` as one batch, in original order.
    pub async fn run_all(
        &self,
        descriptors: Vec<RequestDescriptor>,
        config: ConcurrentConfig,
    ) -> Result<(Vec<TaskOutcome>, ConcurrentStats)> {
        self.run_prepared(descriptors.into_iter().map(Ok).collect(), config).await
    }

    /// Run a batch where each item is either a descriptor still awaiting
    /// dispatch, or an already-settled outcome (e.g. a request-interceptor
    /// failure from preparation) that should appear in the results at its
    /// original index without consuming a concurrency slot.
    pub async fn run_prepared(
        &self,
        items: Vec<std::result::Result<RequestDescriptor, Result<crate::transport::TransportValue>>>,
        config: ConcurrentConfig,
    ) -> Result<(Vec<TaskOutcome>, ConcurrentStats)> {
        if let Some(max) = config.max_concurrency {
            if max == 0 {
                return Err(factory::validation(
                    "Max concurrency must be positive",
                    ErrorContext::new(),
                ));
            }
        }

        let count = items.len();
        let collector = Arc::new(ResultCollector::<TaskOutcome>::new(count));
        let max_concurrency_used = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let permits = config
            .max_concurrency
            .filter(|&m| m < count.max(1))
            .map(Semaphore::new)
            .map(Arc::new);

        let fail_fast_tripped = Arc::new(tokio_util::sync::CancellationToken::new());

        let body = async {
            let mut handles = Vec::with_capacity(count);
            for (index, item) in items.into_iter().enumerate() {
                if config.fail_fast && fail_fast_tripped.is_cancelled() {
                    break;
                }

                let descriptor = match item {
                    Ok(descriptor) => descriptor,
                    Err(settled) => {
                        if config.fail_fast && settled.is_err() {
                            fail_fast_tripped.cancel();
                        }
                        collector.set_result(
                            index,
                            TaskOutcome {
                                index,
                                result: settled,
                                duration: Duration::ZERO,
                            },
                        );
                        continue;
                    }
                };

                let runner = self.runner.clone();
                let collector = collector.clone();
                let permits = permits.clone();
                let in_flight = in_flight.clone();
                let max_used = max_concurrency_used.clone();
                let fail_fast_tripped = fail_fast_tripped.clone();
                let fail_fast = config.fail_fast;

                handles.push(tokio::spawn(async move {
                    let _permit = if let Some(sem) = &permits {
                        if fail_fast && fail_fast_tripped.is_cancelled() {
                            return;
                        }
                        match sem.acquire().await {
                            Ok(permit) => Some(permit),
                            Err(err) => {
                                collector.set_result(
                                    index,
                                    TaskOutcome {
                                        index,
                                        result: Err(err),
                                        duration: Duration::ZERO,
                                    },
                                );
                                return;
                            }
                        }
                    } else {
                        None
                    };

                    if fail_fast && fail_fast_tripped.is_cancelled() {
                        return;
                    }

                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_used.fetch_max(current, Ordering::SeqCst);

                    let started = tokio::time::Instant::now();
                    let result = runner(descriptor).await;
                    let duration = started.elapsed();

                    in_flight.fetch_sub(1, Ordering::SeqCst);

                    if fail_fast && result.is_err() {
                        fail_fast_tripped.cancel();
                    }

                    collector.set_result(
                        index,
                        TaskOutcome {
                            index,
                            result,
                            duration,
                        },
                    );
                }));
            }

            for handle in handles {
                let _ = handle.await;
            }
        };

        if let Some(timeout) = config.timeout {
            let timeout = timeout.min(MAX_BATCH_TIMEOUT);
            if tokio::time::timeout(timeout, body).await.is_err() {
                return Err(factory::timeout_error(
                    format!("Batch timed out after {}ms", timeout.as_millis()),
                    ErrorContext::new(),
                ));
            }
        } else {
            body.await;
        }

        let outcomes = collector.results();

        if config.fail_fast {
            if let Some(failure) = outcomes.iter().find(|o| o.result.is_err()) {
                return Err(failure.result.clone().unwrap_err());
            }
        }

        let stats = Self::stats_from(&outcomes, max_concurrency_used.load(Ordering::SeqCst), count);
        Ok((outcomes, stats))
    }

    /// Run `count` copies of `descriptor`, indexed 0..count.
    pub async fn run_multiple(
        &self,
        descriptor: RequestDescriptor,
        count: usize,
        config: ConcurrentConfig,
    ) -> Result<(Vec<TaskOutcome>, ConcurrentStats)> {
        let descriptors = (0..count).map(|_| descriptor.clone()).collect();
        self.run_all(descriptors, config).await
    }

    fn stats_from(outcomes: &[TaskOutcome], max_concurrency_used: usize, dispatched: usize) -> ConcurrentStats {
        let succeeded: Vec<&TaskOutcome> = outcomes.iter().filter(|o| o.result.is_ok()).collect();
        let failed = outcomes.len() - succeeded.len();

        let (sum, min, max) = succeeded.iter().fold(
            (0.0_f64, f64::INFINITY, 0.0_f64),
            |(sum, min, max), outcome| {
                let ms = outcome.duration.as_secs_f64() * 1000.0;
                (sum + ms, min.min(ms), max.max(ms))
            },
        );

        ConcurrentStats {
            dispatched,
            completed: succeeded.len(),
            failed,
            max_concurrency_used: max_concurrency_used.max(if dispatched > 0 { 1 } else { 0 }),
            avg_duration_ms: if succeeded.is_empty() { 0.0 } else { sum / succeeded.len() as f64 },
            min_duration_ms: if succeeded.is_empty() { 0.0 } else { min },
            max_duration_ms: max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Method;
    use crate::transport::TransportValue;

    fn echo_runner() -> TaskRunner {
        Arc::new(|desc: RequestDescriptor| {
            Box::pin(async move { Ok(TransportValue::Text(desc.url.clone())) })
        })
    }

    #[tokio::test]
    async fn unbounded_dispatches_all_immediately() {
        let executor = ConcurrentExecutor::new(echo_runner());
        let descs: Vec<_> = (0..5).map(|i| RequestDescriptor::new(format!("/{i}"), Method::Get)).collect();
        let (outcomes, stats) = executor.run_all(descs, ConcurrentConfig::default()).await.unwrap();
        assert_eq!(outcomes.len(), 5);
        assert_eq!(stats.max_concurrency_used, 5);
        assert_eq!(stats.completed, 5);
    }

    #[tokio::test]
    async fn bounded_concurrency_caps_simultaneous_dispatch() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));
        let in_flight_clone = in_flight.clone();
        let observed_max_clone = observed_max.clone();
        let runner: TaskRunner = Arc::new(move |_desc| {
            let in_flight = in_flight_clone.clone();
            let observed_max = observed_max_clone.clone();
            Box::pin(async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(TransportValue::Text("ok".to_string()))
            })
        });

        let executor = ConcurrentExecutor::new(runner);
        let descs: Vec<_> = (0..6).map(|i| RequestDescriptor::new(format!("/{i}"), Method::Get)).collect();
        let config = ConcurrentConfig {
            max_concurrency: Some(2),
            ..Default::default()
        };
        let (_outcomes, stats) = executor.run_all(descs, config).await.unwrap();
        assert!(observed_max.load(Ordering::SeqCst) <= 2);
        assert_eq!(stats.max_concurrency_used, 2);
    }

    #[tokio::test]
    async fn fail_fast_returns_first_failure() {
        let runner: TaskRunner = Arc::new(|desc: RequestDescriptor| {
            Box::pin(async move {
                if desc.url == "/bad" {
                    Err(factory::network_error("boom", ErrorContext::new()))
                } else {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(TransportValue::Text(desc.url))
                }
            })
        });

        let executor = ConcurrentExecutor::new(runner);
        let descs = vec![
            RequestDescriptor::new("/bad", Method::Get),
            RequestDescriptor::new("/ok", Method::Get),
        ];
        let config = ConcurrentConfig {
            fail_fast: true,
            ..Default::default()
        };
        let err = executor.run_all(descs, config).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Network);
    }

    #[tokio::test]
    async fn permissive_mode_collects_every_outcome() {
        let runner: TaskRunner = Arc::new(|desc: RequestDescriptor| {
            Box::pin(async move {
                if desc.url == "/bad" {
                    Err(factory::network_error("boom", ErrorContext::new()))
                } else {
                    Ok(TransportValue::Text(desc.url))
                }
            })
        });

        let executor = ConcurrentExecutor::new(runner);
        let descs = vec![
            RequestDescriptor::new("/bad", Method::Get),
            RequestDescriptor::new("/ok", Method::Get),
        ];
        let (outcomes, stats) = executor
            .run_all(descs, ConcurrentConfig::default())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn batch_timeout_rejects_when_exceeded() {
        let runner: TaskRunner = Arc::new(|_desc| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(TransportValue::Text("late".to_string()))
            })
        });
        let executor = ConcurrentExecutor::new(runner);
        let descs = vec![RequestDescriptor::new("/slow", Method::Get)];
        let config = ConcurrentConfig {
            timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let err = executor.run_all(descs, config).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Timeout);
        assert!(err.message.contains("ms"));
    }

    #[tokio::test]
    async fn zero_max_concurrency_is_rejected_before_dispatch() {
        let executor = ConcurrentExecutor::new(echo_runner());
        let descs = vec![RequestDescriptor::new("/a", Method::Get)];
        let config = ConcurrentConfig {
            max_concurrency: Some(0),
            ..Default::default()
        };
        let err = executor.run_all(descs, config).await.unwrap_err();
        assert_eq!(err.message, "Max concurrency must be positive");
    }

    #[tokio::test]
    async fn run_multiple_dispatches_indexed_copies() {
        let executor = ConcurrentExecutor::new(echo_runner());
        let desc = RequestDescriptor::new("/same", Method::Get);
        let (outcomes, _stats) = executor
            .run_multiple(desc, 4, ConcurrentConfig::default())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 4);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
        }
    }
}
