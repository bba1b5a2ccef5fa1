//! Best-effort TTL cache for computed summaries.
//!
//! Entries are never expired by the cache itself. Readers receive the entry's age
//! and decide whether it is fresh, so a stale value stays available as a fallback.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_MAX_ENTRIES: usize = 256;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// `"{family}:{window}"`, e.g. `summary:7d` or `report:2026-09`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub family: String,
    pub window: String,
}

impl CacheKey {
    pub fn new(family: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            window: window.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.window)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(value: Value, ttl_secs: u64) -> Self {
        Self {
            value,
            stored_at: Utc::now(),
            ttl_secs,
        }
    }

    fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.stored_at).num_seconds()).unwrap_or(0)
    }
}

/// A hit, annotated with how old it is.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub age_secs: u64,
    pub ttl_secs: u64,
}

impl CachedValue {
    pub fn is_fresh(&self) -> bool {
        self.age_secs <= self.ttl_secs
    }
}

#[async_trait]
pub trait CacheLayer: Send + Sync {
    async fn get_with_age(&self, key: &str) -> Result<Option<CachedValue>, CacheError>;

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<(), CacheError>;
}

/// Bounded in-process cache. Over capacity, the oldest entries are dropped first.
#[derive(Debug)]
pub struct MemoryCache {
    max_entries: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store a prepared entry as-is, keeping its `stored_at`.
    pub async fn insert_entry(&self, key: &str, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
        while entries.len() > self.max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&oldest);
            debug!(key = %oldest, "evicted cache entry");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheLayer for MemoryCache {
    async fn get_with_age(&self, key: &str) -> Result<Option<CachedValue>, CacheError> {
        let entries = self.entries.read().await;
        let now = Utc::now();
        Ok(entries.get(key).map(|entry| CachedValue {
            value: entry.value.clone(),
            stored_at: entry.stored_at,
            age_secs: entry.age_secs(now),
            ttl_secs: entry.ttl_secs,
        }))
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<(), CacheError> {
        self.insert_entry(key, CacheEntry::new(value, ttl_secs)).await;
        Ok(())
    }
}

/// Cache that never holds anything; every read is a miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCache;

#[async_trait]
impl CacheLayer for DisabledCache {
    async fn get_with_age(&self, _key: &str) -> Result<Option<CachedValue>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Value, _ttl_secs: u64) -> Result<(), CacheError> {
        Ok(())
    }
}
