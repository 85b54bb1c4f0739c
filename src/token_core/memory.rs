//! In-memory default implementations for the storage seams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::store::{CacheEntry, EntryPredicate, NonceStore, TokenCache};
use super::types::TokenError;

#[derive(Debug, Clone)]
struct Stored {
    entry: CacheEntry,
    expires_at: u64,
}

/// Token cache held in a concurrent map. Clones share the same entries.
#[derive(Clone)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, Stored>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    /// Creates an empty cache driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty cache that measures TTLs with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(DashMap::new()), clock }
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, stored| stored.expires_at > now);
    }

    /// Purges expired entries every `interval` on the tokio runtime.
    pub fn spawn_purge(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                cache.purge_expired();
                debug!(remaining = cache.len(), "purged expired token cache entries");
            }
        })
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCache for InMemoryCache {
    async fn put(&self, key: &str, entry: CacheEntry, ttl: u64) -> Result<(), TokenError> {
        let expires_at = self.clock.now().saturating_add(ttl);
        self.entries.insert(key.to_string(), Stored { entry, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TokenError> {
        let now = self.clock.now();
        let live = match self.entries.get(key) {
            Some(stored) => (stored.expires_at > now).then(|| stored.entry.clone()),
            None => return Ok(None),
        };
        if live.is_none() {
            self.entries.remove_if(key, |_, stored| stored.expires_at <= now);
        }
        Ok(live)
    }

    async fn delete(&self, key: &str) -> Result<(), TokenError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, predicate: EntryPredicate<'_>) -> Result<bool, TokenError> {
        let now = self.clock.now();
        let removed = self
            .entries
            .remove_if(key, |_, stored| stored.expires_at > now && predicate(&stored.entry));
        Ok(removed.is_some())
    }
}

/// Nonce store held in a concurrent map. Clones share the same records.
#[derive(Clone)]
pub struct InMemoryNonceStore {
    seen: Arc<DashMap<String, u64>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { seen: Arc::new(DashMap::new()), clock }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.seen.retain(|_, expires_at| *expires_at > now);
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn check_and_insert(&self, key: &str, ttl: u64) -> Result<bool, TokenError> {
        let now = self.clock.now();
        let expires_at = now.saturating_add(ttl);
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut seen) => {
                if *seen.get() > now {
                    Ok(false)
                } else {
                    seen.insert(expires_at);
                    Ok(true)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }
}
