//! TTL cache in front of the prediction provider. Strictly an optimisation: backend
//! failures turn into misses on read and are dropped on write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::observability;
use crate::provider::{PredictionInput, PredictionOutput};

const KEY_PREFIX: &str = "prediction";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    /// Remove every key starting with `prefix`. Returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Process-local backend. Expired entries are dropped lazily on read.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if *expires_at > now {
                return Ok(Some(value.clone()));
            }
        }
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - self.entries.len())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheHealth {
    pub enabled: bool,
    pub reachable: bool,
    pub default_ttl_secs: u64,
    pub detail: Option<String>,
}

/// `cache_key` canonicalises through `serde_json::Value`, whose maps are sorted, so two
/// inputs with the same fields always hash alike.
pub fn cache_key(model: &str, input: &PredictionInput) -> Result<String, CacheError> {
    let canonical = serde_json::to_string(&serde_json::to_value(input)?)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{KEY_PREFIX}:{model}:{}", hex::encode(digest)))
}

pub struct PredictionCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    enabled: bool,
}

impl PredictionCache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration, enabled: bool) -> Self {
        Self {
            backend,
            default_ttl,
            enabled,
        }
    }

    /// Cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()), Duration::ZERO, false)
    }

    pub async fn get(&self, model: &str, input: &PredictionInput) -> Option<PredictionOutput> {
        if !self.enabled {
            return None;
        }
        let result = match cache_key(model, input) {
            Ok(key) => self.backend.get(&key).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(output) => {
                    metrics::counter!(observability::CACHE_LOOKUPS_TOTAL, "result" => "hit").increment(1);
                    debug!(model, flight_id = %input.flight_id, "prediction cache hit");
                    Some(output)
                }
                Err(e) => {
                    warn!(model, error = %e, "discarding undecodable cache entry");
                    metrics::counter!(observability::CACHE_LOOKUPS_TOTAL, "result" => "error").increment(1);
                    None
                }
            },
            Ok(None) => {
                metrics::counter!(observability::CACHE_LOOKUPS_TOTAL, "result" => "miss").increment(1);
                None
            }
            Err(e) => {
                warn!(model, error = %e, "cache read failed, treating as miss");
                metrics::counter!(observability::CACHE_LOOKUPS_TOTAL, "result" => "error").increment(1);
                None
            }
        }
    }

    /// Store with `ttl`, or the default TTL. Failures are logged and dropped.
    pub async fn set(&self, model: &str, input: &PredictionInput, output: &PredictionOutput, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let ttl = ttl.unwrap_or(self.default_ttl);
        if let Err(e) = self.try_set(model, input, output, ttl).await {
            warn!(model, error = %e, "cache write failed");
            metrics::counter!(observability::CACHE_WRITE_ERRORS_TOTAL).increment(1);
        }
    }

    async fn try_set(
        &self,
        model: &str,
        input: &PredictionInput,
        output: &PredictionOutput,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = cache_key(model, input)?;
        let value = serde_json::to_string(output)?;
        self.backend.set(&key, value, ttl).await
    }

    /// Drop every cached prediction of one model.
    pub async fn clear(&self, model: &str) -> Result<usize, CacheError> {
        let removed = self.backend.delete_prefix(&format!("{KEY_PREFIX}:{model}:")).await?;
        debug!(model, removed, "cleared prediction cache");
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<usize, CacheError> {
        self.backend.delete_prefix(&format!("{KEY_PREFIX}:")).await
    }

    pub async fn health(&self) -> CacheHealth {
        let ping = self.backend.ping().await;
        CacheHealth {
            enabled: self.enabled,
            reachable: ping.is_ok(),
            default_ttl_secs: self.default_ttl.as_secs(),
            detail: ping.err().map(|e| e.to_string()),
        }
    }
}
