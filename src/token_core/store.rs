//! Storage seams consumed by the engine: the shared token cache and the nonce replay store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{TokenError, TokenInfo};

/// Server-side state for a handle or key identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub info: TokenInfo,
    /// Per-token shared secret (request-signing formats only).
    pub secret: Option<String>,
    /// Authorization-code-like tokens are consumed by their first validation.
    pub single_use: bool,
}

/// Predicate evaluated atomically by [`TokenCache::compare_and_delete`].
pub type EntryPredicate<'a> = &'a (dyn Fn(&CacheEntry) -> bool + Send + Sync);

/// Key-value store with per-entry TTL.
///
/// Every method must be atomic with respect to concurrent callers. A missing
/// key is not an error; the engine turns absence into `unknown_handle` or
/// `unknown_identifier`.
#[async_trait]
pub trait TokenCache: Send + Sync + 'static {
    /// Store an entry that expires `ttl` seconds from now.
    async fn put(&self, key: &str, entry: CacheEntry, ttl: u64) -> Result<(), TokenError>;

    /// Retrieve a live entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TokenError>;

    /// Remove an entry if present.
    async fn delete(&self, key: &str) -> Result<(), TokenError>;

    /// Remove the entry only if it is live and satisfies `predicate`.
    /// Returns whether this call removed it.
    async fn compare_and_delete(&self, key: &str, predicate: EntryPredicate<'_>) -> Result<bool, TokenError>;
}

/// Replay protection for signed requests.
#[async_trait]
pub trait NonceStore: Send + Sync + 'static {
    /// Atomically record `key` for `ttl` seconds.
    /// Returns `false` when the key was already recorded and is still live.
    async fn check_and_insert(&self, key: &str, ttl: u64) -> Result<bool, TokenError>;
}
