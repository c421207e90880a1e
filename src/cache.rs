//! Fingerprint-keyed single-flight response cache (C7, §4.7).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::descriptor::RequestDescriptor;
use crate::error::Result;
use crate::fingerprint::{Fingerprinter, HashAlgorithm};
use crate::serial::TaskRunner;
use crate::transport::TransportValue;

#[derive(Clone)]
pub struct CacheConfig {
    pub max_key_length: usize,
    pub hash_algorithm: HashAlgorithm,
    pub headers_whitelist: Vec<String>,
    pub default_ttl: Option<Duration>,
    /// Optional cap on distinct entries; oldest-accessed is evicted first.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_key_length: 512,
            hash_algorithm: HashAlgorithm::Fast,
            headers_whitelist: Vec::new(),
            default_ttl: None,
            max_entries: None,
        }
    }
}

/// A cache access event, broadcast for observability (grounded in
/// `InMemoryRequestManager::get_status_updates` / `status_tx`).
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit { fingerprint: String },
    Miss { fingerprint: String },
    Evicted { fingerprint: String },
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub in_flight: usize,
}

enum Entry {
    InFlight {
        notify: Arc<Notify>,
        result: Arc<Mutex<Option<Result<TransportValue>>>>,
    },
    Ready {
        value: TransportValue,
        expires_at: Option<Instant>,
        last_accessed: Mutex<Instant>,
    },
}

enum Action {
    Return(TransportValue),
    Wait(Arc<Notify>, Arc<Mutex<Option<Result<TransportValue>>>>),
    Load(Arc<Notify>, Arc<Mutex<Option<Result<TransportValue>>>>),
}

/// Maps a request fingerprint to either a stored value or the single
/// in-flight load computing it (§4.7). Backed by `dashmap::DashMap`
/// (the teacher's `fusillade` dependency) for lock-striped concurrent
/// access per key.
pub struct RequestCache {
    table: DashMap<String, Entry>,
    fingerprinter: Fingerprinter,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    events: tokio::sync::broadcast::Sender<CacheEvent>,
}

impl RequestCache {
    pub fn new(config: CacheConfig) -> Self {
        let fingerprinter = Fingerprinter::new(
            config.max_key_length,
            config.hash_algorithm,
            config.headers_whitelist.clone(),
        );
        let (events, _) = tokio::sync::broadcast::channel(64);
        Self {
            table: DashMap::new(),
            fingerprinter,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            events,
        }
    }

    pub fn fingerprint(&self, descriptor: &RequestDescriptor) -> String {
        self.fingerprinter.fingerprint(descriptor)
    }

    /// Subscribe to hit/miss/eviction events. Purely in-process
    /// observability — dropping the receiver is safe at any time.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Fetch `fingerprint`'s cached value, or run `loader` — coalescing
    /// concurrent callers for the same key into a single load (§4.7).
    pub async fn get_or_load<F, Fut>(
        &self,
        fingerprint: String,
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<TransportValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TransportValue>>,
    {
        loop {
            let action = match self.table.entry(fingerprint.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut occ) => match occ.get() {
                    Entry::Ready {
                        value,
                        expires_at,
                        last_accessed,
                    } => {
                        if expires_at.map(|at| Instant::now() >= at).unwrap_or(false) {
                            let notify = Arc::new(Notify::new());
                            let result = Arc::new(Mutex::new(None));
                            occ.insert(Entry::InFlight {
                                notify: notify.clone(),
                                result: result.clone(),
                            });
                            Action::Load(notify, result)
                        } else {
                            *last_accessed.lock() = Instant::now();
                            Action::Return(value.clone())
                        }
                    }
                    Entry::InFlight { notify, result } => Action::Wait(notify.clone(), result.clone()),
                },
                dashmap::mapref::entry::Entry::Vacant(vac) => {
                    let notify = Arc::new(Notify::new());
                    let result = Arc::new(Mutex::new(None));
                    vac.insert(Entry::InFlight {
                        notify: notify.clone(),
                        result: result.clone(),
                    });
                    Action::Load(notify, result)
                }
            };

            match action {
                Action::Return(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Action::Wait(notify, result) => {
                    notify.notified().await;
                    if let Some(settled) = result.lock().clone() {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return settled;
                    }
                    // Spurious wake with no settled value yet (the loader's
                    // own `Load` branch raced ahead of recording it); retry.
                }
                Action::Load(notify, result_slot) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let loaded = loader().await;
                    *result_slot.lock() = Some(loaded.clone());

                    match &loaded {
                        Ok(value) => {
                            let ttl = ttl.or(self.config.default_ttl);
                            self.table.insert(
                                fingerprint.clone(),
                                Entry::Ready {
                                    value: value.clone(),
                                    expires_at: ttl.map(|d| Instant::now() + d),
                                    last_accessed: Mutex::new(Instant::now()),
                                },
                            );
                            self.maybe_evict();
                        }
                        Err(_) => {
                            self.table.remove(&fingerprint);
                        }
                    }

                    notify.notify_waiters();
                    return loaded;
                }
            }
        }
    }

    /// Load every descriptor in `descriptors` into the cache up front,
    /// using `runner` as the loader (§4.7 `warmup`). Best-effort: a failed
    /// warmup load simply does not populate that entry.
    pub async fn warmup(&self, descriptors: Vec<RequestDescriptor>, runner: TaskRunner, ttl: Option<Duration>) {
        let futures = descriptors.into_iter().map(|descriptor| {
            let fingerprint = self.fingerprint(&descriptor);
            let runner = runner.clone();
            async move {
                let _ = self
                    .get_or_load(fingerprint, || runner(descriptor), ttl)
                    .await;
            }
        });
        futures::future::join_all(futures).await;
    }

    fn maybe_evict(&self) {
        let Some(max) = self.config.max_entries else { return };
        while self.table.len() > max {
            let oldest_key = self
                .table
                .iter()
                .filter_map(|entry| match entry.value() {
                    Entry::Ready { last_accessed, .. } => Some((entry.key().clone(), *last_accessed.lock())),
                    Entry::InFlight { .. } => None,
                })
                .min_by_key(|(_, accessed)| *accessed)
                .map(|(key, _)| key);

            match oldest_key {
                Some(key) => {
                    self.table.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Remove one entry, or every entry if `fingerprint` is `None`.
    pub fn clear(&self, fingerprint: Option<&str>) {
        match fingerprint {
            Some(key) => {
                self.table.remove(key);
            }
            None => self.table.clear(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let in_flight = self
            .table
            .iter()
            .filter(|entry| matches!(entry.value(), Entry::InFlight { .. }))
            .count();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.table.len(),
            in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Method;
    use crate::error::factory;
    use crate::error::ErrorContext;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn repeated_key_hits_cache() {
        let cache = RequestCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = cache
                .get_or_load(
                    "k".to_string(),
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(TransportValue::Text("v".to_string()))
                    },
                    None,
                )
                .await
                .unwrap();
            assert_eq!(value, TransportValue::Text("v".to_string()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn concurrent_callers_single_flight() {
        let cache = Arc::new(RequestCache::new(CacheConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(
                        "shared".to_string(),
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(TransportValue::Text("v".to_string()))
                        },
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_a_miss() {
        let cache = RequestCache::new(CacheConfig::default());
        cache
            .get_or_load(
                "k".to_string(),
                || async move { Ok(TransportValue::Text("first".to_string())) },
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let value = cache
            .get_or_load(
                "k".to_string(),
                || async move { Ok(TransportValue::Text("second".to_string())) },
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, TransportValue::Text("second".to_string()));
    }

    #[tokio::test]
    async fn failed_load_does_not_poison_the_cache() {
        let cache = RequestCache::new(CacheConfig::default());
        let first = cache
            .get_or_load(
                "k".to_string(),
                || async move { Err(factory::network_error("boom", ErrorContext::new())) },
                None,
            )
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_load(
                "k".to_string(),
                || async move { Ok(TransportValue::Text("recovered".to_string())) },
                None,
            )
            .await
            .unwrap();
        assert_eq!(second, TransportValue::Text("recovered".to_string()));
    }

    #[tokio::test]
    async fn max_entries_evicts_least_recently_accessed() {
        let config = CacheConfig {
            max_entries: Some(2),
            ..Default::default()
        };
        let cache = RequestCache::new(config);

        for key in ["a", "b", "c"] {
            cache
                .get_or_load(
                    key.to_string(),
                    || async move { Ok(TransportValue::Text(key.to_string())) },
                    None,
                )
                .await
                .unwrap();
        }

        assert_eq!(cache.stats().size, 2);
    }

    #[tokio::test]
    async fn clear_with_key_removes_only_that_entry() {
        let cache = RequestCache::new(CacheConfig::default());
        for key in ["a", "b"] {
            cache
                .get_or_load(
                    key.to_string(),
                    || async move { Ok(TransportValue::Text(key.to_string())) },
                    None,
                )
                .await
                .unwrap();
        }
        cache.clear(Some("a"));
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn warmup_populates_every_descriptor() {
        let cache = RequestCache::new(CacheConfig::default());
        let runner: TaskRunner = Arc::new(|desc: RequestDescriptor| {
            Box::pin(async move { Ok(TransportValue::Text(desc.url)) })
        });
        let descs = vec![
            RequestDescriptor::new("/a", Method::Get),
            RequestDescriptor::new("/b", Method::Get),
        ];
        cache.warmup(descs, runner, None).await;
        assert_eq!(cache.stats().size, 2);
    }
}
