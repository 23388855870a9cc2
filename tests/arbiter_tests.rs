//! Provider arbiter: handle cache and assistant config read-through.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::Notify;

use common::*;
use turnstile::arbiter::{assistant_cache_key, ArbiterOptions, ProviderArbiter};
use turnstile::cache::{FastCache, InMemoryCache};
use turnstile::error::TurnstileError;
use turnstile::models::RouteTable;
use turnstile::store::{AssistantConfig, InMemoryStore, Store};

struct Fixture {
    arbiter: Arc<ProviderArbiter>,
    factory: Arc<CountingFactory>,
    store: Arc<InMemoryStore>,
}

fn fixture(cache: Option<Arc<dyn FastCache>>, options: ArbiterOptions) -> Fixture {
    let factory = CountingFactory::new(ScriptedProvider::new());
    let store = Arc::new(InMemoryStore::new());
    let arbiter = Arc::new(ProviderArbiter::new(
        RouteTable::builtin(),
        factory.clone(),
        store.clone(),
        cache,
        options,
    ));
    Fixture {
        arbiter,
        factory,
        store,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolves_construct_one_handle() {
    let f = fixture(None, ArbiterOptions::default());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let arbiter = Arc::clone(&f.arbiter);
            tokio::spawn(async move { arbiter.resolve(MODEL).await })
        })
        .collect();
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(f.factory.builds(), 1);
    assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    let stats = f.arbiter.handle_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 15);
    assert_eq!(stats.size, 1);
}

#[tokio::test]
async fn least_recently_used_handle_is_evicted() {
    let f = fixture(
        None,
        ArbiterOptions {
            handle_capacity: 2,
            ..ArbiterOptions::default()
        },
    );

    f.arbiter.resolve("openai:model-a").await.unwrap();
    f.arbiter.resolve("openai:model-b").await.unwrap();
    f.arbiter.resolve("openai:model-a").await.unwrap();
    f.arbiter.resolve("openai:model-c").await.unwrap();
    assert_eq!(f.factory.builds(), 3);
    assert_eq!(f.arbiter.handle_stats().evictions, 1);
    assert_eq!(f.arbiter.handle_stats().size, 2);

    // `a` was touched more recently than `b`, so `b` went.
    f.arbiter.resolve("openai:model-a").await.unwrap();
    assert_eq!(f.factory.builds(), 3);
    f.arbiter.resolve("openai:model-b").await.unwrap();
    assert_eq!(f.factory.builds(), 4);
}

#[tokio::test]
async fn handle_routes_carry_family_and_budget() {
    let f = fixture(None, ArbiterOptions::default());
    let handle = f.arbiter.resolve("ollama:qwen3:8b").await.unwrap();
    assert_eq!(handle.route().family, turnstile::normalize::BackendFamily::Hermes);
    assert_eq!(handle.route().upstream_model, "qwen3:8b");
    assert!(handle.budget().limit() < handle.route().context_window);
}

#[tokio::test]
async fn unknown_model_never_reaches_the_factory() {
    let f = fixture(None, ArbiterOptions::default());
    for id in ["nosuch:model", "no-colon", "openai:"] {
        let err = f.arbiter.resolve(id).await.unwrap_err();
        assert!(matches!(err, TurnstileError::UnknownModel(_)), "{id}: {err}");
    }
    assert_eq!(f.factory.builds(), 0);
    assert_eq!(f.arbiter.handle_stats().size, 0);
}

#[tokio::test]
async fn unreachable_cache_falls_back_to_store() {
    let cache = Arc::new(UnreachableCache::default());
    let f = fixture(Some(cache.clone()), ArbiterOptions::default());
    let assistant = AssistantConfig::new(MODEL, "be brief");
    f.store.create_assistant(assistant.clone()).await.unwrap();

    assert_eq!(f.arbiter.get_assistant_config(&assistant.id).await.unwrap(), assistant);
    assert_eq!(cache.calls.load(Ordering::SeqCst), 2, "one read, one write-back");

    f.arbiter.invalidate_assistant(&assistant.id).await;
    f.arbiter.update_assistant(assistant.clone()).await.unwrap();
    assert_eq!(cache.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn missing_assistant_is_not_found() {
    let cache = Arc::new(InMemoryCache::default());
    let f = fixture(Some(cache.clone()), ArbiterOptions::default());
    let err = f.arbiter.get_assistant_config("asst_missing").await.unwrap_err();
    assert!(matches!(err, TurnstileError::NotFound { .. }));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn cached_config_is_served_until_invalidated() {
    let cache = Arc::new(InMemoryCache::default());
    let f = fixture(Some(cache.clone()), ArbiterOptions::default());
    let assistant = AssistantConfig::new(MODEL, "v1");
    f.store.create_assistant(assistant.clone()).await.unwrap();
    f.arbiter.get_assistant_config(&assistant.id).await.unwrap();

    // A write that bypasses the arbiter is not seen yet.
    let mut edited = assistant.clone();
    edited.instructions = "v2".into();
    f.store.update_assistant(edited.clone()).await.unwrap();
    assert_eq!(f.arbiter.get_assistant_config(&assistant.id).await.unwrap().instructions, "v1");

    f.arbiter.invalidate_assistant(&assistant.id).await;
    assert_eq!(f.arbiter.get_assistant_config(&assistant.id).await.unwrap().instructions, "v2");

    // Writes through the arbiter are visible at once.
    let mut edited = edited;
    edited.instructions = "v3".into();
    f.arbiter.update_assistant(edited).await.unwrap();
    assert_eq!(f.arbiter.get_assistant_config(&assistant.id).await.unwrap().instructions, "v3");
}

#[tokio::test(start_paused = true)]
async fn cached_config_expires_after_ttl() {
    let cache = Arc::new(InMemoryCache::default());
    let f = fixture(
        Some(cache.clone()),
        ArbiterOptions {
            assistant_ttl: Duration::from_secs(60),
            ..ArbiterOptions::default()
        },
    );
    let assistant = AssistantConfig::new(MODEL, "v1");
    f.store.create_assistant(assistant.clone()).await.unwrap();
    f.arbiter.get_assistant_config(&assistant.id).await.unwrap();

    let mut edited = assistant.clone();
    edited.instructions = "v2".into();
    f.store.update_assistant(edited).await.unwrap();

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(f.arbiter.get_assistant_config(&assistant.id).await.unwrap().instructions, "v1");

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(f.arbiter.get_assistant_config(&assistant.id).await.unwrap().instructions, "v2");
    assert!(cache
        .get(&assistant_cache_key(&assistant.id))
        .await
        .unwrap()
        .is_some_and(|raw| raw.contains("v2")));
}

/// Parks the first write-back until released.
struct GatedCache {
    inner: InMemoryCache,
    gate_writes: AtomicBool,
    parked: Notify,
    release: Notify,
}

impl GatedCache {
    fn new() -> Self {
        Self {
            inner: InMemoryCache::default(),
            gate_writes: AtomicBool::new(true),
            parked: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl FastCache for GatedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, TurnstileError> {
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), TurnstileError> {
        if self.gate_writes.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.release.notified().await;
        }
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), TurnstileError> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn update_racing_a_write_back_is_not_overwritten() {
    let cache = Arc::new(GatedCache::new());
    let f = fixture(Some(cache.clone()), ArbiterOptions::default());
    let mut assistant = AssistantConfig::new(MODEL, "old instructions");
    f.store.create_assistant(assistant.clone()).await.unwrap();

    let reader = {
        let arbiter = Arc::clone(&f.arbiter);
        let id = assistant.id.clone();
        tokio::spawn(async move { arbiter.get_assistant_config(&id).await })
    };
    cache.parked.notified().await;

    assistant.instructions = "new instructions".into();
    f.arbiter.update_assistant(assistant.clone()).await.unwrap();
    cache.release.notify_one();

    // The racing reader may return what it read, but must not leave it cached.
    let raced = reader.await.unwrap().unwrap();
    assert_eq!(raced.instructions, "old instructions");
    assert!(cache.inner.get(&assistant_cache_key(&assistant.id)).await.unwrap().is_none());
    assert_eq!(
        f.arbiter.get_assistant_config(&assistant.id).await.unwrap().instructions,
        "new instructions"
    );
}
