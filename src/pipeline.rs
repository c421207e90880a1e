//! Top-level entry point: `execute()` (C9, §4.1).
//!
//! Ties together every other component. The pipeline owns its
//! `InterceptorChain`, `SerialManager`, optional `RequestCache`,
//! `ConcurrentExecutor` and `Transport` reference (§3 ownership); nothing
//! outside the pipeline touches the serial manager's or cache's maps
//! directly (§5 shared-resource policy).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::cache::{CacheConfig, CacheStats, RequestCache};
use crate::cancellation::ArmedTimeout;
use crate::concurrent::{ConcurrentConfig, ConcurrentExecutor, ConcurrentStats, TaskOutcome};
use crate::config::GlobalConfig;
use crate::descriptor::RequestDescriptor;
use crate::error::{factory, ErrorContext, Result};
use crate::interceptor::{Interceptor, InterceptorChain, InterceptorStats};
use crate::serial::{SerialConfig, SerialManager, SerialManagerConfig, SerialManagerStats, TaskRunner};
use crate::transport::{Transport, TransportValue};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregated introspection across every owned component, returned by
/// [`RequestPipeline::all_stats`] and the façade's `get_all_stats` (§6).
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub interceptors: InterceptorStats,
    pub serial: SerialManagerStats,
    pub cache: Option<CacheStats>,
}

/// Builds the shared [`TaskRunner`] used uniformly by the direct path, the
/// serial queue, the concurrent executor, and the cache's loader: arm a
/// merged abort signal around one transport call, then run the
/// response/error interceptor phases (§4.1 step 4, §4.9). The request phase
/// runs earlier, before routing, in `execute()` and in `prepare()` below —
/// both call sites funnel through `InterceptorChain::run_request` so the
/// phase fires exactly once per call regardless of which routing path a
/// descriptor takes afterward.
fn build_runner(transport: Arc<dyn Transport>, chain: Arc<InterceptorChain>) -> TaskRunner {
    Arc::new(move |descriptor: RequestDescriptor| {
        let transport = transport.clone();
        let chain = chain.clone();
        Box::pin(async move {
            let hook_descriptor = descriptor.clone();
            let timeout = descriptor.timeout.unwrap_or(DEFAULT_TIMEOUT);
            let armed = ArmedTimeout::arm(timeout, descriptor.abort_signal.clone());
            let started = tokio::time::Instant::now();

            let outcome = tokio::select! {
                result = transport.request(&descriptor, armed.token.clone()) => result,
                _ = armed.token.cancelled() => {
                    Err(armed.translate_abort(&descriptor, started.elapsed().as_millis()))
                }
            };
            armed.disarm();

            match outcome {
                Ok(value) => chain.run_response(value, &hook_descriptor),
                Err(err) => chain.run_error(err, &hook_descriptor),
            }
        })
    })
}

/// Strip trailing separators from `base` and leading ones from `path`
/// before joining, so callers never end up with `//` or a missing `/`
/// (§4.1 step 2).
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Orchestrates one `execute()` call end to end (§4.1).
pub struct RequestPipeline {
    chain: Arc<InterceptorChain>,
    serial: SerialManager,
    cache: Option<RequestCache>,
    executor: ConcurrentExecutor,
    runner: TaskRunner,
    global: RwLock<GlobalConfig>,
    serial_default_config: SerialConfig,
}

impl RequestPipeline {
    pub fn new(transport: Arc<dyn Transport>, global: GlobalConfig) -> Self {
        Self::with_cache(transport, global, None)
    }

    pub fn with_cache(
        transport: Arc<dyn Transport>,
        global: GlobalConfig,
        cache_config: Option<CacheConfig>,
    ) -> Self {
        let chain = Arc::new(InterceptorChain::new());
        let runner = build_runner(transport, chain.clone());
        let serial_default_config = SerialConfig::default();
        let serial = SerialManager::new(
            SerialManagerConfig {
                default_queue_config: serial_default_config.clone(),
                ..SerialManagerConfig::default()
            },
            runner.clone(),
        );
        let executor = ConcurrentExecutor::new(runner.clone());
        let cache = cache_config.map(RequestCache::new);

        Self {
            chain,
            serial,
            cache,
            executor,
            runner,
            global: RwLock::new(global),
            serial_default_config,
        }
    }

    /// Merge global config into `descriptor` — per-call values win (§4.1
    /// step 2). Builds an absolute URL against `baseURL` when `url` is
    /// relative.
    fn merge(&self, mut descriptor: RequestDescriptor) -> RequestDescriptor {
        let global = self.global.read();

        if let Some(base) = &global.base_url {
            if !is_absolute(&descriptor.url) {
                descriptor.url = join_url(base, &descriptor.url);
            }
        }

        for (key, value) in &global.headers {
            let already_set = descriptor
                .headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case(key));
            if !already_set {
                descriptor.headers.push((key.clone(), value.clone()));
            }
        }

        if descriptor.timeout.is_none() {
            descriptor.timeout = global.timeout;
        }

        descriptor
    }

    /// Build the per-call `SerialConfig` for a first-time enqueue: the
    /// manager's default queue config with any `metadata.serial_config`
    /// fields layered on top. Ignored entirely if this isn't the first
    /// enqueue for the key (§4.4, §9 "first wins, rest ignored").
    fn serial_config_for(&self, descriptor: &RequestDescriptor) -> Option<SerialConfig> {
        let overrides = descriptor.metadata.serial_config.as_ref()?;
        let mut cfg = self.serial_default_config.clone();
        if let Some(max) = overrides.max_queue_size {
            cfg.capacity = Some(max);
        }
        if let Some(timeout) = overrides.queue_timeout {
            cfg.queue_timeout = Some(timeout);
        }
        Some(cfg)
    }

    /// Entry point (§4.1). Validates, merges config, runs request
    /// interceptors, then routes to the serial queue, the cache, or
    /// directly to the transport.
    #[tracing::instrument(skip(self, descriptor), fields(url = %descriptor.url, method = %descriptor.method.as_str()))]
    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<TransportValue> {
        tracing::debug!("execute: start");

        if let Err(err) = descriptor.validate() {
            tracing::warn!(error = %err, "execute: validation failed");
            return Err(err);
        }

        let merged = self.merge(descriptor);
        let context = merged.clone();

        let descriptor = match self.chain.run_request(merged) {
            Ok(descriptor) => descriptor,
            Err(err) => return self.chain.run_error(err, &context),
        };

        if let Some(key) = descriptor.effective_serial_key() {
            let key = key.to_string();
            let override_config = self.serial_config_for(&descriptor);
            let receiver = self.serial.enqueue(&key, descriptor, override_config)?;
            return receiver.await.map_err(|_| {
                factory::concurrent_error(
                    "serial queue dropped the task before it settled",
                    ErrorContext::new(),
                )
            })?;
        }

        let cache_enabled = descriptor
            .metadata
            .cache_config
            .as_ref()
            .and_then(|c| c.enabled)
            .unwrap_or(true);

        if cache_enabled {
            if let Some(cache) = &self.cache {
                let fingerprint = cache.fingerprint(&descriptor);
                let ttl = descriptor.metadata.cache_config.as_ref().and_then(|c| c.ttl);
                let runner = self.runner.clone();
                let loaded_descriptor = descriptor.clone();
                return cache
                    .get_or_load(fingerprint, move || runner(loaded_descriptor), ttl)
                    .await;
            }
        }

        (self.runner)(descriptor).await
    }

    /// Run a descriptor through config merge and the request-interceptor
    /// phase, the same preparation `execute()` does before routing (§4.1
    /// step 2-3). On interceptor failure, runs the error phase and returns
    /// its outcome as a settled failure rather than propagating the error
    /// out of batch preparation.
    fn prepare(&self, descriptor: RequestDescriptor) -> std::result::Result<RequestDescriptor, Result<TransportValue>> {
        let merged = self.merge(descriptor);
        let context = merged.clone();
        self.chain.run_request(merged).map_err(|err| self.chain.run_error(err, &context))
    }

    /// Run a batch of descriptors through the same interceptor-wrapped
    /// transport call, with bounded parallelism (§4.2).
    pub async fn execute_all(
        &self,
        descriptors: Vec<RequestDescriptor>,
        config: ConcurrentConfig,
    ) -> Result<(Vec<TaskOutcome>, ConcurrentStats)> {
        let mut prepared = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            prepared.push(self.prepare(descriptor));
        }
        self.executor.run_prepared(prepared, config).await
    }

    /// Run `count` copies of one descriptor through the batch executor
    /// (§4.2).
    pub async fn execute_multiple(
        &self,
        descriptor: RequestDescriptor,
        count: usize,
        config: ConcurrentConfig,
    ) -> Result<(Vec<TaskOutcome>, ConcurrentStats)> {
        let merged = self.merge(descriptor);
        let prepared: Vec<_> = (0..count)
            .map(|_| {
                let context = merged.clone();
                self.chain
                    .run_request(merged.clone())
                    .map_err(|err| self.chain.run_error(err, &context))
            })
            .collect();
        self.executor.run_prepared(prepared, config).await
    }

    pub fn set_global_config(&self, global: GlobalConfig) {
        *self.global.write() = global;
    }

    /// Subscribe to cache hit/miss/eviction events, for observability
    /// surfaces like the demo's SSE endpoint. If caching isn't configured
    /// the returned receiver simply never yields anything.
    pub fn cache_events(&self) -> tokio::sync::broadcast::Receiver<crate::cache::CacheEvent> {
        match &self.cache {
            Some(cache) => cache.subscribe(),
            None => {
                // No cache configured: the sender is dropped immediately,
                // so the stream ends right away instead of hanging.
                let (_tx, rx) = tokio::sync::broadcast::channel(1);
                rx
            }
        }
    }

    pub fn add_interceptor(&self, interceptor: Interceptor) -> Result<()> {
        self.chain.add(interceptor)
    }

    pub fn clear_interceptors(&self) {
        self.chain.clear();
    }

    pub fn clear_cache(&self, fingerprint: Option<&str>) {
        if let Some(cache) = &self.cache {
            cache.clear(fingerprint);
        }
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn all_stats(&self) -> PipelineStats {
        PipelineStats {
            interceptors: self.chain.stats(),
            serial: self.serial.stats(),
            cache: self.cache_stats(),
        }
    }

    /// Tear down every owned component. Post-destroy, introspection must
    /// keep working without raising (§5 destroy safety).
    pub fn destroy(&self) {
        self.serial.destroy();
        if let Some(cache) = &self.cache {
            cache.clear(None);
        }
        self.chain.clear();
    }
}
