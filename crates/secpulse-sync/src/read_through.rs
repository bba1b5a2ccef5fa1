//! Get-or-compute over the cache with graceful degradation.
//!
//! Summary and report reads go through [`ReadThrough::get_or_compute`], which
//! labels each response with how current it is.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use secpulse_storage::{CacheLayer, CachedValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Computed for this request.
    Fresh,
    /// Served from cache within its TTL.
    Cached,
    /// Served from cache past its TTL.
    Stale,
    /// Compute failed and nothing was cached; served from persisted history.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Serve an expired entry immediately and refresh it in the background.
    #[default]
    StaleWhileRevalidate,
    /// Recompute before answering; expired entries are only used if that fails.
    Blocking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Served<T> {
    pub value: T,
    pub freshness: Freshness,
    pub age_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Served<T> {
    fn new(value: T, freshness: Freshness, age_secs: u64, error: Option<String>) -> Self {
        Self {
            value,
            freshness,
            age_secs,
            error,
        }
    }
}

#[derive(Debug, Error)]
#[error("{key} unavailable: {compute}; fallback also failed: {fallback}")]
pub struct ReadError {
    pub key: String,
    pub compute: String,
    pub fallback: String,
}

#[derive(Clone)]
pub struct ReadThrough {
    cache: Arc<dyn CacheLayer>,
    policy: StalePolicy,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl ReadThrough {
    pub fn new(cache: Arc<dyn CacheLayer>, policy: StalePolicy) -> Self {
        Self {
            cache,
            policy,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheLayer> {
        &self.cache
    }

    /// Serve `key`, computing it when the cache has nothing usable.
    ///
    /// `compute` is only polled if needed and may be moved to a background task.
    /// `fallback` reads persisted history and is only awaited when compute fails
    /// with no cached value to fall back to.
    pub async fn get_or_compute<T, C, F>(
        &self,
        key: &str,
        ttl_secs: u64,
        compute: C,
        fallback: F,
    ) -> Result<Served<T>, ReadError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        C: Future<Output = anyhow::Result<T>> + Send + 'static,
        F: Future<Output = anyhow::Result<T>>,
    {
        let mut stale: Option<(T, u64)> = None;

        if let Some((value, entry)) = self.lookup::<T>(key).await {
            if entry.is_fresh() {
                return Ok(Served::new(value, Freshness::Cached, entry.age_secs, None));
            }
            if self.policy == StalePolicy::StaleWhileRevalidate {
                self.spawn_refresh(key, ttl_secs, compute).await;
                return Ok(Served::new(value, Freshness::Stale, entry.age_secs, None));
            }
            stale = Some((value, entry.age_secs));
        }

        let compute_err = match compute.await {
            Ok(value) => {
                if let Some(encoded) = encode(key, &value) {
                    put(self.cache.as_ref(), key, encoded, ttl_secs).await;
                }
                return Ok(Served::new(value, Freshness::Fresh, 0, None));
            }
            Err(err) => err,
        };
        warn!(key, error = %format!("{compute_err:#}"), "compute failed");

        if let Some((value, age_secs)) = stale {
            return Ok(Served::new(
                value,
                Freshness::Stale,
                age_secs,
                Some(format!("{compute_err:#}")),
            ));
        }

        match fallback.await {
            Ok(value) => Ok(Served::new(
                value,
                Freshness::Degraded,
                0,
                Some(format!("{compute_err:#}")),
            )),
            Err(fallback_err) => Err(ReadError {
                key: key.to_string(),
                compute: format!("{compute_err:#}"),
                fallback: format!("{fallback_err:#}"),
            }),
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<(T, CachedValue)> {
        let entry = match self.cache.get_with_age(key).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as a miss");
                return None;
            }
        };
        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(value) => Some((value, entry)),
            Err(err) => {
                warn!(key, error = %err, "ignoring undecodable cache entry");
                None
            }
        }
    }

    async fn spawn_refresh<T, C>(&self, key: &str, ttl_secs: u64, compute: C)
    where
        T: Serialize + Send + 'static,
        C: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if !self.refreshing.lock().await.insert(key.to_string()) {
            debug!(key, "refresh already in flight");
            return;
        }
        let cache = self.cache.clone();
        let refreshing = self.refreshing.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            // Run the compute in its own task so a panic still releases the key.
            match tokio::spawn(compute).await {
                Ok(Ok(value)) => {
                    if let Some(encoded) = encode(&key, &value) {
                        put(cache.as_ref(), &key, encoded, ttl_secs).await;
                    }
                }
                Ok(Err(err)) => {
                    warn!(key = %key, error = %format!("{err:#}"), "background refresh failed")
                }
                Err(err) => warn!(key = %key, error = %err, "background refresh task died"),
            }
            refreshing.lock().await.remove(&key);
        });
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|err| warn!(key, error = %err, "could not encode value for cache"))
        .ok()
}

async fn put(cache: &dyn CacheLayer, key: &str, encoded: serde_json::Value, ttl_secs: u64) {
    if let Err(err) = cache.set(key, encoded, ttl_secs).await {
        warn!(key, error = %err, "cache write failed");
    }
}
