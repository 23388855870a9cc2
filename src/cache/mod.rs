//! Fast key-value cache collaborator.
//!
//! The arbiter treats this cache as optional: every error it returns is
//! logged and answered from the store instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::TurnstileError;

#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, TurnstileError>;
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration)
        -> Result<(), TurnstileError>;
    async fn delete(&self, key: &str) -> Result<(), TurnstileError>;
}

/// In-process TTL + LRU cache.
#[derive(Clone)]
pub struct InMemoryCache {
    inner: Arc<RwLock<CacheInner>>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    max_entries: usize,
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
    last_accessed: Instant,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                entries: HashMap::new(),
                max_entries: max_entries.max(1),
            })),
        }
    }

    fn lock_err() -> TurnstileError {
        TurnstileError::Cache("cache lock poisoned".into())
    }

    /// Current number of entries, expired ones included until next write.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FastCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, TurnstileError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let now = Instant::now();
        let expired = inner.entries.get(key).map(|e| e.expires_at <= now);
        match expired {
            Some(true) => {
                inner.entries.remove(key);
                Ok(None)
            }
            Some(false) => Ok(inner.entries.get_mut(key).map(|entry| {
                entry.last_accessed = now;
                entry.value.clone()
            })),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), TurnstileError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let now = Instant::now();
        inner.entries.retain(|_, e| e.expires_at > now);

        if !inner.entries.contains_key(key) && inner.entries.len() >= inner.max_entries {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TurnstileError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        inner.entries.remove(key);
        Ok(())
    }
}
