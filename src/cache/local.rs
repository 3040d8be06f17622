//! In-process, fixed-capacity LRU store.

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{CacheKey, CacheStore, CachedResponse, StoreError};

struct Slot {
    response: CachedResponse,
    inserted: Instant,
}

/// Bounded in-memory store with strict least-recently-used eviction.
///
/// `len() <= capacity()` holds at all times. A lookup refreshes recency; an
/// entry never looked up ages from its insertion. With a TTL configured,
/// expiry is checked lazily: an expired entry reads as absent and is purged.
///
/// All operations are synchronous under a short critical section; the
/// `async` signatures exist only to satisfy [`CacheStore`].
pub struct BoundedLocalStore {
    entries: Mutex<LruCache<CacheKey, Slot>>,
    ttl: Option<Duration>,
}

impl BoundedLocalStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: None,
        }
    }

    /// Entries older than `ttl` are treated as absent on lookup.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `key` is present, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains(key)
    }

    fn expired(&self, slot: &Slot) -> bool {
        self.ttl.is_some_and(|ttl| slot.inserted.elapsed() >= ttl)
    }

    fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(slot) if !self.expired(slot) => return Some(slot.response.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.pop(key);
        debug!(key = %key, "purged expired entry");
        None
    }

    fn put(&self, key: &CacheKey, response: &CachedResponse) {
        let slot = Slot {
            response: response.clone(),
            inserted: Instant::now(),
        };
        let displaced = self.entries.lock().push(key.clone(), slot);
        if let Some((evicted, _)) = displaced.filter(|(k, _)| k != key) {
            debug!(evicted = %evicted, "evicted least recently used entry");
        }
    }
}

#[async_trait]
impl CacheStore for BoundedLocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedResponse>, StoreError> {
        Ok(self.get(key))
    }

    async fn store(&self, key: &CacheKey, response: &CachedResponse) -> Result<(), StoreError> {
        self.put(key, response);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.entries.lock().pop(key);
        Ok(())
    }
}
