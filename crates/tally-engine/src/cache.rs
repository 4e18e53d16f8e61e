//! Short-lived result cache for read endpoints.
//!
//! Entries are keyed by the semantic [`CacheKey`] itself, so selective
//! invalidation can match on operation or resource directly. The SHA-256
//! fingerprint of a key is only used where an opaque identifier is needed
//! (logs, diagnostics).

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::{identity::Actor, worker::BackgroundWorker};

pub const LIST_QUERIES: &str = "list_queries";
pub const GET_QUERY: &str = "get_query";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Identity of a cached read: the operation, the resource it targets and the
/// caller whose visibility shaped the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub operation: String,
    pub resource: Option<String>,
    pub actor: Actor,
}

impl CacheKey {
    pub fn new(operation: impl Into<String>, resource: Option<String>, actor: Actor) -> Self {
        Self {
            operation: operation.into(),
            resource,
            actor,
        }
    }

    pub fn list_queries(actor: Actor) -> Self {
        Self::new(LIST_QUERIES, None, actor)
    }

    pub fn get_query(query_id: i64, actor: Actor) -> Self {
        Self::new(GET_QUERY, Some(query_id.to_string()), actor)
    }

    /// Hex SHA-256 over the key's components.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.operation)?;
        if let Some(resource) = &self.resource {
            write!(f, ":{resource}")?;
        }
        write!(f, ":{}:{}", self.actor.user_id, self.actor.role)
    }
}

/// Selection of entries dropped by an administrative clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    All,
    List,
    Query(i64),
}

impl ClearScope {
    fn matches(&self, key: &CacheKey) -> bool {
        match self {
            ClearScope::All => true,
            ClearScope::List => key.operation == LIST_QUERIES,
            ClearScope::Query(id) => key.resource.as_deref() == Some(id.to_string().as_str()),
        }
    }
}

impl FromStr for ClearScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "" | "all" => Ok(ClearScope::All),
            "list" => Ok(ClearScope::List),
            other => other
                .strip_prefix("query:")
                .and_then(|id| id.trim().parse::<i64>().ok())
                .map(ClearScope::Query)
                .ok_or_else(|| {
                    format!("invalid cache scope '{other}'; expected all, list or query:<id>")
                }),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    /// `None` when the TTL reaches past what the clock can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-wide TTL cache. Each operation takes the lock once, so individual
/// calls are atomic; nothing spans calls.
#[derive(Debug)]
pub struct ResultCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Returns the value if present and unexpired.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: CacheKey, value: Value, ttl: Duration) {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries
            .write()
            .insert(key, CacheEntry { value, expires_at });
    }

    /// [`ResultCache::set`] with the configured default TTL.
    pub fn insert(&self, key: CacheKey, value: Value) {
        self.set(key, value, self.config.default_ttl);
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn flush(&self) {
        self.entries.write().clear();
    }

    /// Keys currently held, expired or not.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry matching `scope` and returns how many went.
    pub fn invalidate(&self, scope: ClearScope) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !scope.matches(key));
        before - entries.len()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

/// Periodically purges expired entries so memory stays bounded even for keys
/// nobody reads again.
pub struct CacheSweeper {
    cache: Arc<ResultCache>,
}

impl CacheSweeper {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl BackgroundWorker for CacheSweeper {
    fn name(&self) -> &'static str {
        "cache-sweeper"
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let period = self.cache.config().cleanup_interval.max(Duration::from_secs(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = self.cache.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = self.cache.len(), "purged expired cache entries");
            }
        }
    }
}
