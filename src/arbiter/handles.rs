//! Bounded LRU of provider handles with single-flight construction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::TurnstileError;

/// Counters for the handle cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleCacheStats {
    /// Lookups that found a slot, including ones that joined an in-flight construction.
    pub hits: u64,
    /// Lookups that started a construction.
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

struct Slot<V> {
    cell: Arc<OnceCell<V>>,
    last_used: u64,
}

struct Inner<V> {
    slots: HashMap<String, Slot<V>>,
    tick: u64,
    stats: HandleCacheStats,
}

/// Each key owns a `OnceCell`; concurrent callers for one key await the same
/// construction. A failed construction leaves nothing behind, so the next
/// caller retries.
pub struct HandleCache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone + Send + Sync> HandleCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                tick: 0,
                stats: HandleCacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner<V>>, TurnstileError> {
        self.inner
            .lock()
            .map_err(|_| TurnstileError::Cache("handle cache lock poisoned".into()))
    }

    fn slot_for(&self, key: &str) -> Result<Arc<OnceCell<V>>, TurnstileError> {
        let mut inner = self.lock()?;
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(slot) = inner.slots.get_mut(key) {
            slot.last_used = tick;
            let cell = Arc::clone(&slot.cell);
            inner.stats.hits += 1;
            return Ok(cell);
        }

        if inner.slots.len() >= self.capacity {
            let lru = inner
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                inner.slots.remove(&lru);
                inner.stats.evictions += 1;
                debug!(key = %lru, "evicted provider handle");
            }
        }

        let cell = Arc::new(OnceCell::new());
        inner.slots.insert(
            key.to_string(),
            Slot {
                cell: Arc::clone(&cell),
                last_used: tick,
            },
        );
        inner.stats.misses += 1;
        inner.stats.size = inner.slots.len();
        Ok(cell)
    }

    /// Return the cached value for `key`, constructing it with `init` on a miss.
    pub async fn get_or_try_init<F, Fut>(&self, key: &str, init: F) -> Result<V, TurnstileError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, TurnstileError>>,
    {
        let cell = self.slot_for(key)?;
        match cell.get_or_try_init(init).await {
            Ok(value) => Ok(value.clone()),
            Err(err) => {
                let mut inner = self.lock()?;
                let stale = inner
                    .slots
                    .get(key)
                    .is_some_and(|slot| Arc::ptr_eq(&slot.cell, &cell) && !cell.initialized());
                if stale {
                    inner.slots.remove(key);
                    inner.stats.size = inner.slots.len();
                }
                Err(err)
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.slots.remove(key);
            inner.stats.size = inner.slots.len();
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .map(|inner| inner.slots.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HandleCacheStats {
        self.lock().map(|inner| inner.stats).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_lookups_construct_once() {
        let cache = Arc::new(HandleCache::<usize>::new(4));
        let builds = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                tokio::spawn(async move {
                    cache
                        .get_or_try_init("openai:gpt-4o", || async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(builds.fetch_add(1, Ordering::SeqCst) + 100)
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 100);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 15);
    }

    #[tokio::test]
    async fn least_recently_used_key_is_evicted() {
        let cache = HandleCache::<&'static str>::new(2);
        cache.get_or_try_init("a", || async { Ok("a") }).await.unwrap();
        cache.get_or_try_init("b", || async { Ok("b") }).await.unwrap();
        cache.get_or_try_init("a", || async { Ok("a") }).await.unwrap();
        cache.get_or_try_init("c", || async { Ok("c") }).await.unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failed_construction_is_not_cached() {
        let cache = HandleCache::<u8>::new(2);
        let err = cache
            .get_or_try_init("k", || async { Err(TurnstileError::Configuration("no key".into())) })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_try_init("k", || async { Ok(7) }).await.unwrap(), 7);
    }
}
