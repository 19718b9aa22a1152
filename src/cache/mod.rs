//! Short-TTL cache for read projections.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::events::{EventHandler, InventoryEvent};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        ServiceError::CacheError(err.to_string())
    }
}

pub const STATUS_PREFIX: &str = "inventory:status:";
pub const LOW_STOCK_PREFIX: &str = "inventory:low_stock:";

pub fn status_key(variant_id: Uuid) -> String {
    format!("{}{}", STATUS_PREFIX, variant_id)
}

pub fn low_stock_key(threshold: i32) -> String {
    format!("{}{}", LOW_STOCK_PREFIX, threshold)
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Removes every key starting with `prefix`; returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(expires_at) if Instant::now() >= expires_at)
    }
}

/// Process-local cache; entries without a TTL live until deleted.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let store = self.store.read().await;
            match store.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.store.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.store
            .write()
            .await
            .insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.write().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|key, _| !key.starts_with(prefix));
        Ok(before - store.len())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let store = self.store.read().await;
        Ok(store.get(key).map_or(false, |entry| !entry.is_expired()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.store.write().await.clear();
        Ok(())
    }
}

pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn CacheBackend,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CacheError::SerializationError(e.to_string())),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn CacheBackend,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), CacheError> {
    let raw =
        serde_json::to_string(value).map_err(|e| CacheError::SerializationError(e.to_string()))?;
    cache.set(key, &raw, ttl).await
}

/// Evicts projections made stale by a stock change: the variant's status
/// and every cached low-stock page.
pub struct CacheInvalidationHandler {
    cache: Arc<dyn CacheBackend>,
}

impl CacheInvalidationHandler {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventHandler for CacheInvalidationHandler {
    fn name(&self) -> &'static str {
        "cache_invalidation"
    }

    async fn handle_event(&self, event: &InventoryEvent) -> Result<(), String> {
        let variant_id = event.variant_id();
        self.cache
            .delete(&status_key(variant_id))
            .await
            .map_err(|e| e.to_string())?;
        let evicted = self
            .cache
            .delete_prefix(LOW_STOCK_PREFIX)
            .await
            .map_err(|e| e.to_string())?;
        debug!(%variant_id, low_stock_pages = evicted, "invalidated cached projections");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::inventory_transaction::TransactionType;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_keys() {
        let cache = InMemoryCache::new();
        cache.set(&low_stock_key(5), "[]", None).await.unwrap();
        cache.set(&low_stock_key(10), "[]", None).await.unwrap();
        cache.set("other", "x", None).await.unwrap();

        assert_eq!(cache.delete_prefix(LOW_STOCK_PREFIX).await.unwrap(), 2);
        assert!(cache.exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn stock_change_evicts_status_and_low_stock_pages() {
        let cache = Arc::new(InMemoryCache::new());
        let variant_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        cache.set(&status_key(variant_id), "{}", None).await.unwrap();
        cache.set(&status_key(other), "{}", None).await.unwrap();
        cache.set(&low_stock_key(5), "[]", None).await.unwrap();

        let handler = CacheInvalidationHandler::new(cache.clone());
        handler
            .handle_event(&InventoryEvent::StockChanged {
                variant_id,
                product_id: Uuid::new_v4(),
                delta: 1,
                reserved_delta: 0,
                transaction_type: TransactionType::StockIn,
                on_hand: 1,
                reserved: 0,
            })
            .await
            .unwrap();

        assert!(!cache.exists(&status_key(variant_id)).await.unwrap());
        assert!(!cache.exists(&low_stock_key(5)).await.unwrap());
        assert!(cache.exists(&status_key(other)).await.unwrap());
    }
}
