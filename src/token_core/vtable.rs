//! Cache-backed token entries and their distribution between authorization
//! and resource servers.
//!
//! Entries travel as flat string lists so any message channel can carry them:
//!
//! * push: `["push", id, issue_time, expires_in, single_use, secret, bindings...]`
//! * pull query: `["pull", id]`
//! * pull answer: `["ok", issue_time, expires_in, single_use, secret, bindings...]`
//!   or `["error", code]`
//!
//! `single_use` is `0` or `1`; `secret` is `-` when absent and `+secret` otherwise.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::clock::Clock;
use super::compose::ConfigError;
use super::context::{AuthorizationServer, ResourceServer, RoleKind, TokenType};
use super::store::{CacheEntry, TokenCache};
use super::types::{TokenError, TokenInfo};

/// Failure reported by a vtable handler.
pub type VtableError = Box<dyn Error + Send + Sync>;

/// How cache entries reach resource servers that do not share the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VtableMode {
    /// The cache is shared (or nothing needs distributing).
    #[default]
    None,
    /// The authorization server pushes every created entry.
    AuthservPush,
    /// Resource servers pull entries they miss locally.
    ResourcePull,
}

impl VtableMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VtableMode::None => "none",
            VtableMode::AuthservPush => "authserv_push",
            VtableMode::ResourcePull => "resource_pull",
        }
    }
}

/// Delivers a pushed entry to the resource servers.
#[async_trait]
pub trait VtablePush: Send + Sync + 'static {
    async fn push(&self, entry: Vec<String>) -> Result<(), VtableError>;
}

/// Asks the authorization server about an entry.
#[async_trait]
pub trait VtablePull: Send + Sync + 'static {
    async fn pull(&self, query: Vec<String>) -> Result<Vec<String>, VtableError>;
}

/// Where a fetched entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// Answered by the authorization server, which already consumed it if single-use.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub entry: CacheEntry,
    pub origin: Origin,
}

fn entry_fields(entry: &CacheEntry) -> Vec<String> {
    let mut fields = vec![
        entry.info.issue_time.to_string(),
        entry.info.expires_in.to_string(),
        if entry.single_use { "1" } else { "0" }.to_string(),
        match &entry.secret {
            Some(secret) => format!("+{}", secret),
            None => "-".to_string(),
        },
    ];
    fields.extend(entry.info.bindings.iter().cloned());
    fields
}

fn parse_entry_fields(fields: &[String]) -> Result<CacheEntry, TokenError> {
    let malformed = || TokenError::Malformed("vtable entry is truncated or invalid".into());
    if fields.len() < 4 {
        return Err(malformed());
    }
    let issue_time = fields[0].parse().map_err(|_| malformed())?;
    let expires_in = fields[1].parse().map_err(|_| malformed())?;
    let single_use = match fields[2].as_str() {
        "0" => false,
        "1" => true,
        _ => return Err(malformed()),
    };
    let secret = match fields[3].as_str() {
        "-" => None,
        s => Some(s.strip_prefix('+').ok_or_else(malformed)?.to_string()),
    };
    Ok(CacheEntry {
        info: TokenInfo { issue_time, expires_in, bindings: fields[4..].to_vec() },
        secret,
        single_use,
    })
}

/// Encodes a push message.
pub fn encode_push(id: &str, entry: &CacheEntry) -> Vec<String> {
    let mut message = vec!["push".to_string(), id.to_string()];
    message.extend(entry_fields(entry));
    message
}

/// Decodes a push message into its identifier and entry.
pub fn decode_push(message: &[String]) -> Result<(String, CacheEntry), TokenError> {
    match message {
        [tag, id, rest @ ..] if tag == "push" => Ok((id.clone(), parse_entry_fields(rest)?)),
        _ => Err(TokenError::Malformed("not a vtable push message".into())),
    }
}

fn error_answer(code: &str) -> Vec<String> {
    vec!["error".to_string(), code.to_string()]
}

/// Cache-backed entries of one scheme, plus their vtable distribution.
pub struct EntryStore {
    namespace: String,
    cache: Arc<dyn TokenCache>,
    clock: Arc<dyn Clock>,
    mode: VtableMode,
    push: Option<Arc<dyn VtablePush>>,
    pull: Option<Arc<dyn VtablePull>>,
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("namespace", &self.namespace)
            .field("mode", &self.mode)
            .field("push", &self.push.is_some())
            .field("pull", &self.pull.is_some())
            .finish()
    }
}

impl EntryStore {
    pub fn new(
        namespace: String,
        cache: Arc<dyn TokenCache>,
        clock: Arc<dyn Clock>,
        mode: VtableMode,
        push: Option<Arc<dyn VtablePush>>,
        pull: Option<Arc<dyn VtablePull>>,
    ) -> Self {
        Self { namespace, cache, clock, mode, push, pull }
    }

    pub fn mode(&self) -> VtableMode {
        self.mode
    }

    pub fn has_push_handler(&self) -> bool {
        self.push.is_some()
    }

    pub fn has_pull_handler(&self) -> bool {
        self.pull.is_some()
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.namespace, id)
    }

    fn unused_key(&self, id: &str) -> String {
        format!("{}:{}#unused", self.namespace, id)
    }

    /// Stores the entry until `issue_time + expires_in`; expired entries are skipped.
    async fn store_local(&self, id: &str, entry: &CacheEntry) -> Result<(), TokenError> {
        let ttl = entry.info.remaining(self.clock.now());
        if ttl == 0 {
            debug!("entry already expired, not stored");
            return Ok(());
        }
        self.cache.put(&self.key(id), entry.clone(), ttl).await?;
        if entry.single_use {
            self.cache.put(&self.unused_key(id), entry.clone(), ttl).await?;
        }
        Ok(())
    }

    async fn remove_local(&self, id: &str) -> Result<(), TokenError> {
        self.cache.delete(&self.key(id)).await?;
        self.cache.delete(&self.unused_key(id)).await
    }

    /// Best-effort removal after a failed publish; the caller reports the original failure.
    async fn withdraw(&self, id: &str) {
        if let Err(e) = self.remove_local(id).await {
            warn!(error_code = e.error_code(), error = %e, "could not withdraw unpublished entry");
        }
    }

    fn live(&self, entry: &CacheEntry) -> bool {
        entry.info.remaining(self.clock.now()) > 0
    }

    /// Stores a new entry and, in push mode, delivers it before reporting success.
    ///
    /// A failed push removes the local entry again so no token exists without
    /// its resource-server copy.
    #[instrument(skip(self, entry), level = "debug")]
    pub async fn publish(&self, id: &str, entry: CacheEntry) -> Result<(), TokenError> {
        self.store_local(id, &entry).await?;
        if self.mode != VtableMode::AuthservPush {
            return Ok(());
        }
        let handler = match &self.push {
            Some(handler) => handler,
            None => {
                self.withdraw(id).await;
                return Err(ConfigError::MissingHandler {
                    role: "authorization server",
                    handler: "push",
                    mode: self.mode.as_str(),
                }
                .into());
            }
        };
        if let Err(e) = handler.push(encode_push(id, &entry)).await {
            warn!(error_code = "vtable_unavailable", error = %e, "vtable push failed, entry withdrawn");
            self.withdraw(id).await;
            return Err(TokenError::VtableUnavailable(e.to_string()));
        }
        debug!("entry pushed");
        Ok(())
    }

    /// Looks an entry up locally and, for resource servers in pull mode, remotely.
    #[instrument(skip(self), level = "debug")]
    pub async fn fetch(&self, id: &str, role: RoleKind) -> Result<Option<Lookup>, TokenError> {
        if let Some(entry) = self.cache.get(&self.key(id)).await? {
            if !self.live(&entry) {
                return Ok(None);
            }
            return Ok(Some(Lookup { entry, origin: Origin::Local }));
        }
        if role != RoleKind::ResourceServer || self.mode != VtableMode::ResourcePull {
            return Ok(None);
        }
        let handler = self.pull.as_ref().ok_or(ConfigError::MissingHandler {
            role: "resource server",
            handler: "pull",
            mode: self.mode.as_str(),
        })?;
        let answer = handler
            .pull(vec!["pull".to_string(), id.to_string()])
            .await
            .map_err(|e| {
                warn!(error_code = "vtable_unavailable", error = %e, "vtable pull failed");
                TokenError::VtableUnavailable(e.to_string())
            })?;
        let entry = match answer.split_first() {
            Some((tag, fields)) if tag == "ok" => parse_entry_fields(fields)?,
            Some((tag, fields)) if tag == "error" => {
                return match fields.first().map(String::as_str) {
                    Some("unknown") => Ok(None),
                    Some("already_used") => Err(TokenError::AlreadyUsed),
                    other => Err(TokenError::Malformed(format!("unexpected pull error {:?}", other))),
                };
            }
            _ => return Err(TokenError::Malformed("unexpected pull answer".into())),
        };
        let ttl = entry.info.remaining(self.clock.now());
        if ttl == 0 {
            debug!("pulled entry already expired");
            return Ok(None);
        }
        if !entry.single_use {
            self.cache.put(&self.key(id), entry.clone(), ttl).await?;
            debug!(ttl, "pulled entry cached");
        }
        Ok(Some(Lookup { entry, origin: Origin::Remote }))
    }

    /// Marks a single-use entry as used. Returns `false` if it already was.
    pub async fn consume(&self, id: &str) -> Result<bool, TokenError> {
        self.cache.compare_and_delete(&self.unused_key(id), &|_| true).await
    }

    /// Removes an entry from the local cache.
    pub async fn revoke(&self, id: &str) -> Result<(), TokenError> {
        self.remove_local(id).await
    }

    /// Stores an entry pushed by the authorization server.
    #[instrument(skip_all, level = "debug")]
    pub async fn receive_push(&self, message: &[String]) -> Result<(), TokenError> {
        let (id, entry) = decode_push(message)?;
        self.store_local(&id, &entry).await
    }

    /// Answers a resource server's pull query, consuming single-use entries.
    #[instrument(skip_all, level = "debug")]
    pub async fn answer_pull(&self, query: &[String]) -> Result<Vec<String>, TokenError> {
        let id = match query {
            [tag, id] if tag == "pull" => id,
            _ => return Ok(error_answer("malformed")),
        };
        let entry = match self.cache.get(&self.key(id)).await? {
            Some(entry) if self.live(&entry) => entry,
            _ => return Ok(error_answer("unknown")),
        };
        if entry.single_use && !self.consume(id).await? {
            return Ok(error_answer("already_used"));
        }
        let mut answer = vec!["ok".to_string()];
        answer.extend(entry_fields(&entry));
        Ok(answer)
    }
}

/// Push handler that hands entries straight to an in-process resource server.
pub struct LoopbackPush {
    target: TokenType<ResourceServer>,
}

impl LoopbackPush {
    pub fn new(target: TokenType<ResourceServer>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl VtablePush for LoopbackPush {
    async fn push(&self, entry: Vec<String>) -> Result<(), VtableError> {
        use super::context::ResourceServerOps;
        self.target.receive_push(&entry).await.map_err(|e| Box::new(e) as VtableError)
    }
}

/// Pull handler that queries an in-process authorization server.
pub struct LoopbackPull {
    source: TokenType<AuthorizationServer>,
}

impl LoopbackPull {
    pub fn new(source: TokenType<AuthorizationServer>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl VtablePull for LoopbackPull {
    async fn pull(&self, query: Vec<String>) -> Result<Vec<String>, VtableError> {
        use super::context::AuthorizationServerOps;
        self.source.answer_pull(&query).await.map_err(|e| Box::new(e) as VtableError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_core::clock::ManualClock;
    use crate::token_core::memory::InMemoryCache;

    fn store(clock: &ManualClock, mode: VtableMode) -> EntryStore {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        EntryStore::new(
            "bearer".into(),
            Arc::new(InMemoryCache::with_clock(clock.clone())),
            clock,
            mode,
            None,
            None,
        )
    }

    fn entry(single_use: bool, secret: Option<&str>) -> CacheEntry {
        CacheEntry {
            info: TokenInfo::new(1_000, 60, ["client", "", "scope read"]),
            secret: secret.map(String::from),
            single_use,
        }
    }

    #[test]
    fn push_message_round_trips_bindings_and_secret() {
        for e in [entry(false, None), entry(true, Some("")), entry(false, Some("-+x"))] {
            let message = encode_push("id-1", &e);
            assert_eq!(decode_push(&message).unwrap(), ("id-1".to_string(), e));
        }
    }

    #[test]
    fn truncated_push_is_malformed() {
        let message = vec!["push".to_string(), "id".to_string(), "1".to_string()];
        assert!(matches!(decode_push(&message), Err(TokenError::Malformed(_))));
    }

    #[tokio::test]
    async fn answer_pull_consumes_single_use_once() {
        let clock = ManualClock::new(1_000);
        let entries = store(&clock, VtableMode::ResourcePull);
        entries.publish("code", entry(true, None)).await.unwrap();
        let query = vec!["pull".to_string(), "code".to_string()];
        assert_eq!(entries.answer_pull(&query).await.unwrap()[0], "ok");
        assert_eq!(entries.answer_pull(&query).await.unwrap(), vec!["error", "already_used"]);
        let unknown = vec!["pull".to_string(), "nope".to_string()];
        assert_eq!(entries.answer_pull(&unknown).await.unwrap(), vec!["error", "unknown"]);
    }

    /// Cache whose deletes always fail.
    struct StickyCache(InMemoryCache);

    #[async_trait]
    impl TokenCache for StickyCache {
        async fn put(&self, key: &str, entry: CacheEntry, ttl: u64) -> Result<(), TokenError> {
            self.0.put(key, entry, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, TokenError> {
            self.0.get(key).await
        }

        async fn delete(&self, _key: &str) -> Result<(), TokenError> {
            Err(TokenError::Store("backend read-only".into()))
        }

        async fn compare_and_delete(
            &self,
            key: &str,
            predicate: crate::token_core::store::EntryPredicate<'_>,
        ) -> Result<bool, TokenError> {
            self.0.compare_and_delete(key, predicate).await
        }
    }

    struct RefusingPush;

    #[async_trait]
    impl VtablePush for RefusingPush {
        async fn push(&self, _entry: Vec<String>) -> Result<(), VtableError> {
            Err("connection refused".into())
        }
    }

    #[tokio::test]
    async fn failed_withdraw_keeps_original_error() {
        let clock = ManualClock::new(1_000);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let cache = InMemoryCache::with_clock(shared.clone());
        let entries = EntryStore::new(
            "bearer".into(),
            Arc::new(StickyCache(cache.clone())),
            shared.clone(),
            VtableMode::AuthservPush,
            Some(Arc::new(RefusingPush)),
            None,
        );
        let err = entries.publish("h", entry(false, None)).await.unwrap_err();
        assert!(matches!(err, TokenError::VtableUnavailable(ref msg) if msg == "connection refused"));

        let without_handler =
            EntryStore::new("bearer".into(), Arc::new(StickyCache(cache)), shared, VtableMode::AuthservPush, None, None);
        let err = without_handler.publish("h", entry(false, None)).await.unwrap_err();
        assert!(matches!(err, TokenError::Config(ConfigError::MissingHandler { .. })));
    }

    #[tokio::test]
    async fn backdated_entries_expire_at_issue_time_plus_lifetime() {
        let clock = ManualClock::new(1_030);
        let entries = store(&clock, VtableMode::ResourcePull);
        // issued at 1_000 for 60 seconds: 30 seconds left
        entries.publish("h", entry(false, None)).await.unwrap();
        assert!(entries.fetch("h", RoleKind::AuthorizationServer).await.unwrap().is_some());
        clock.advance(30);
        assert!(entries.fetch("h", RoleKind::AuthorizationServer).await.unwrap().is_none());
        let query = vec!["pull".to_string(), "h".to_string()];
        assert_eq!(entries.answer_pull(&query).await.unwrap(), vec!["error", "unknown"]);

        entries.publish("late", entry(false, None)).await.unwrap();
        assert!(entries.fetch("late", RoleKind::AuthorizationServer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_without_push_handler_withdraws_entry() {
        let clock = ManualClock::new(1_000);
        let entries = store(&clock, VtableMode::AuthservPush);
        let err = entries.publish("h", entry(false, None)).await.unwrap_err();
        assert!(matches!(err, TokenError::Config(ConfigError::MissingHandler { .. })));
        assert!(entries.fetch("h", RoleKind::AuthorizationServer).await.unwrap().is_none());
    }
}
