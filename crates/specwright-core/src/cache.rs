//! Content-addressed response cache with TTL expiry
//!
//! Keys are a stable SHA-256 over {model, prompt shape, evidence identity,
//! extra context}; component ordering never affects the key. Entries expire
//! by wall-clock age alone and the backing store is pluggable.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;

/// Compute a stable cache key.
///
/// `evidence` is (reference id, content hash) pairs identifying what the
/// prompt was allowed to read; `extra` is caller-supplied context pairs.
/// Both are sorted before hashing, so callers may pass them in any order.
#[must_use]
pub fn cache_key(
    model: &str,
    prompt: &str,
    evidence: &[(String, String)],
    extra: &[(String, String)],
) -> String {
    let mut evidence: Vec<&(String, String)> = evidence.iter().collect();
    evidence.sort();
    let mut extra: Vec<&(String, String)> = extra.iter().collect();
    extra.sort();

    let mut hasher = Sha256::new();
    // Length-prefix every component so concatenation cannot collide
    for part in [model, prompt] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    for (id, hash) in evidence {
        hasher.update((id.len() as u64).to_be_bytes());
        hasher.update(id.as_bytes());
        hasher.update((hash.len() as u64).to_be_bytes());
        hasher.update(hash.as_bytes());
    }
    for (key, value) in extra {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }

    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A cached response with its storage time and lifetime
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cached response value
    pub value: Value,
    /// Wall-clock storage time (milliseconds since epoch)
    pub stored_at_ms: u64,
    /// Lifetime in milliseconds
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// Whether the entry has outlived its TTL at `now_ms`
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.stored_at_ms) >= self.ttl_ms
    }
}

/// Pluggable backing storage for the response cache
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch an entry by key
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    /// Store an entry under a key
    async fn put(&self, key: &str, entry: CacheEntry);
    /// Remove an entry
    async fn remove(&self, key: &str);
}

/// In-memory cache store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, entry: CacheEntry) {
        self.entries.write().await.insert(key.to_string(), entry);
    }

    async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

/// TTL response cache over a pluggable store
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
}

impl ResponseCache {
    /// Create a cache over the given store
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Create a cache backed by process memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Get a cached value, discarding it if its TTL has elapsed
    pub async fn get(&self, key: &str) -> Option<Value> {
        let entry = self.store.get(key).await?;
        if entry.is_expired(now_ms()) {
            debug!(key, "cache entry expired");
            self.store.remove(key).await;
            return None;
        }
        Some(entry.value)
    }

    /// Store a value under a key with the given TTL
    pub async fn set(&self, key: &str, value: Value, ttl_ms: u64) {
        self.store
            .put(
                key,
                CacheEntry {
                    value,
                    stored_at_ms: now_ms(),
                    ttl_ms,
                },
            )
            .await;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
