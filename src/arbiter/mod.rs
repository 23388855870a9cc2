//! Provider arbiter: cached provider handles and read-through assistant configs.

mod handles;

pub use handles::{HandleCache, HandleCacheStats};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::FastCache;
use crate::config::Settings;
use crate::error::TurnstileError;
use crate::models::RouteTable;
use crate::provider::ProviderFactory;
use crate::store::{AssistantConfig, Store};
use crate::worker::{ProviderHandle, StreamingWorker, WorkerOptions};

/// Key under which an assistant config is cached.
pub fn assistant_cache_key(assistant_id: &str) -> String {
    format!("assistant_config:{assistant_id}")
}

#[derive(Debug, Clone, Copy)]
pub struct ArbiterOptions {
    pub handle_capacity: usize,
    pub assistant_ttl: Duration,
    pub worker: WorkerOptions,
}

impl Default for ArbiterOptions {
    fn default() -> Self {
        Self {
            handle_capacity: 32,
            assistant_ttl: Duration::from_secs(60),
            worker: WorkerOptions::default(),
        }
    }
}

impl ArbiterOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            handle_capacity: settings.cache.handle_capacity,
            assistant_ttl: settings.cache.assistant_ttl(),
            worker: WorkerOptions {
                idle_timeout: settings.stream.idle_timeout(),
                max_tool_call_bytes: settings.stream.max_tool_call_bytes,
                threshold_percent: settings.context.threshold_percent,
                reserve_output_tokens: settings.context.reserve_output_tokens,
            },
        }
    }
}

const GENERATION_STRIPES: usize = 64;

/// Invalidation counters, striped by key hash so memory stays fixed no matter
/// how many assistants come and go. A shared stripe only costs a skipped
/// write-back.
struct Generations([AtomicU64; GENERATION_STRIPES]);

impl Generations {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU64::new(0)))
    }

    fn slot(&self, key: &str) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.0[(hasher.finish() as usize) % GENERATION_STRIPES]
    }

    fn current(&self, key: &str) -> u64 {
        self.slot(key).load(Ordering::SeqCst)
    }

    fn bump(&self, key: &str) {
        self.slot(key).fetch_add(1, Ordering::SeqCst);
    }
}

/// Owns the provider-handle cache and fronts assistant lookups with the
/// optional fast cache. Cheap to share behind an `Arc`.
pub struct ProviderArbiter {
    routes: RouteTable,
    factory: Arc<dyn ProviderFactory>,
    store: Arc<dyn Store>,
    fast_cache: Option<Arc<dyn FastCache>>,
    handles: HandleCache<ProviderHandle>,
    generations: Generations,
    options: ArbiterOptions,
}

impl ProviderArbiter {
    pub fn new(
        routes: RouteTable,
        factory: Arc<dyn ProviderFactory>,
        store: Arc<dyn Store>,
        fast_cache: Option<Arc<dyn FastCache>>,
        options: ArbiterOptions,
    ) -> Self {
        Self {
            routes,
            factory,
            store,
            fast_cache,
            handles: HandleCache::new(options.handle_capacity),
            generations: Generations::new(),
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Resolve a `provider:model` id to a cached streaming worker.
    ///
    /// The route is checked before touching the cache, so an unknown model
    /// never occupies a slot.
    pub async fn resolve(&self, model_id: &str) -> Result<ProviderHandle, TurnstileError> {
        let route = self.routes.resolve(model_id)?;
        let key = route.cache_key();
        let factory = Arc::clone(&self.factory);
        let store = Arc::clone(&self.store);
        let worker_options = self.options.worker;

        self.handles
            .get_or_try_init(&key, || async move {
                debug!(model = %route.cache_key(), "constructing provider handle");
                let provider = factory.create(&route)?;
                Ok(Arc::new(StreamingWorker::new(
                    route,
                    Arc::from(provider),
                    store,
                    worker_options,
                )))
            })
            .await
    }

    pub fn handle_stats(&self) -> HandleCacheStats {
        self.handles.stats()
    }

    /// Read-through lookup: fast cache, then the store, writing the store's
    /// answer back with the configured TTL. Cache failures only log.
    ///
    /// A write-back never outlives an invalidation that raced it: the entry
    /// is skipped, or removed again, when the key's generation moved while
    /// this reader was away.
    pub async fn get_assistant_config(
        &self,
        assistant_id: &str,
    ) -> Result<AssistantConfig, TurnstileError> {
        let key = assistant_cache_key(assistant_id);

        if let Some(cache) = &self.fast_cache {
            match cache.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<AssistantConfig>(&raw) {
                    Ok(config) => return Ok(config),
                    Err(err) => {
                        warn!(assistant_id, error = %err, "discarding undecodable cached assistant config");
                        if let Err(err) = cache.delete(&key).await {
                            warn!(assistant_id, error = %err, "fast cache delete failed");
                        }
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(assistant_id, error = %err, "fast cache unavailable, reading from store");
                }
            }
        }

        let generation = self.generations.current(&key);
        let config = self.store.get_assistant(assistant_id).await?;

        if let Some(cache) = &self.fast_cache {
            if self.generations.current(&key) != generation {
                debug!(assistant_id, "assistant invalidated during read, skipping write-back");
                return Ok(config);
            }
            match serde_json::to_string(&config) {
                Ok(raw) => {
                    if let Err(err) = cache.set_with_ttl(&key, raw, self.options.assistant_ttl).await {
                        warn!(assistant_id, error = %err, "fast cache write failed");
                    }
                    if self.generations.current(&key) != generation {
                        debug!(assistant_id, "assistant invalidated during write-back, removing entry");
                        if let Err(err) = cache.delete(&key).await {
                            warn!(assistant_id, error = %err, "fast cache delete failed");
                        }
                    }
                }
                Err(err) => warn!(assistant_id, error = %err, "assistant config not cacheable"),
            }
        }

        Ok(config)
    }

    /// Drop the cached assistant config. Repeated calls are harmless and a
    /// cache failure is logged, never returned.
    pub async fn invalidate_assistant(&self, assistant_id: &str) {
        let key = assistant_cache_key(assistant_id);
        self.generations.bump(&key);
        if let Some(cache) = &self.fast_cache {
            if let Err(err) = cache.delete(&key).await {
                warn!(assistant_id, error = %err, "failed to invalidate cached assistant config");
            }
        }
    }

    /// Persist an assistant change and bust its cache entry.
    pub async fn update_assistant(&self, assistant: AssistantConfig) -> Result<(), TurnstileError> {
        let id = assistant.id.clone();
        self.store.update_assistant(assistant).await?;
        self.invalidate_assistant(&id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::models::ModelRoute;
    use crate::provider::{ModelProvider, ProviderRequest};
    use crate::store::InMemoryStore;
    use crate::types::RawStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Silent(String);

    #[async_trait]
    impl ModelProvider for Silent {
        fn provider_name(&self) -> &str {
            "test"
        }
        fn model_id(&self) -> &str {
            &self.0
        }
        async fn stream(&self, _request: &ProviderRequest) -> Result<RawStream, TurnstileError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl ProviderFactory for Counting {
        fn create(&self, route: &ModelRoute) -> Result<Box<dyn ModelProvider>, TurnstileError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Silent(route.upstream_model.clone())))
        }
    }

    fn arbiter(cache: Option<Arc<dyn FastCache>>) -> (ProviderArbiter, Arc<Counting>, Arc<InMemoryStore>) {
        let factory = Arc::new(Counting::default());
        let store = Arc::new(InMemoryStore::new());
        let arbiter = ProviderArbiter::new(
            RouteTable::builtin(),
            factory.clone(),
            store.clone(),
            cache,
            ArbiterOptions::default(),
        );
        (arbiter, factory, store)
    }

    #[tokio::test]
    async fn unknown_model_is_not_cached() {
        let (arbiter, factory, _) = arbiter(None);
        assert!(matches!(
            arbiter.resolve("nope:model").await,
            Err(TurnstileError::UnknownModel(_))
        ));
        assert_eq!(factory.0.load(Ordering::SeqCst), 0);
        assert_eq!(arbiter.handle_stats().size, 0);
    }

    #[tokio::test]
    async fn repeated_resolve_reuses_handle() {
        let (arbiter, factory, _) = arbiter(None);
        let a = arbiter.resolve("ollama:qwen3:8b").await.unwrap();
        let b = arbiter.resolve("ollama:qwen3:8b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn assistant_config_is_written_back_and_invalidated() {
        let cache = Arc::new(InMemoryCache::default());
        let (arbiter, _, store) = arbiter(Some(cache.clone()));
        let assistant = AssistantConfig::new("ollama:qwen3:8b", "be brief");
        store.create_assistant(assistant.clone()).await.unwrap();

        assert_eq!(arbiter.get_assistant_config(&assistant.id).await.unwrap(), assistant);
        let key = assistant_cache_key(&assistant.id);
        assert!(cache.get(&key).await.unwrap().is_some());

        arbiter.invalidate_assistant(&assistant.id).await;
        arbiter.invalidate_assistant(&assistant.id).await;
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_cache_entry_falls_back_to_store() {
        let cache = Arc::new(InMemoryCache::default());
        let (arbiter, _, store) = arbiter(Some(cache.clone()));
        let assistant = AssistantConfig::new("ollama:qwen3:8b", "");
        store.create_assistant(assistant.clone()).await.unwrap();
        cache
            .set_with_ttl(&assistant_cache_key(&assistant.id), "{not json".into(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(arbiter.get_assistant_config(&assistant.id).await.unwrap(), assistant);
    }
}
