use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cache::{self, CacheBackend};
use crate::entities::variant_stock;
use crate::errors::ServiceError;
use crate::repositories::{
    InventoryTransactionRepository, TransactionFilter, TransactionPage, VariantStockRepository,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryStatus {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub on_hand: i32,
    pub reserved: i32,
    pub available: i32,
    pub is_unlimited: bool,
    pub is_active: bool,
    pub is_low_stock: bool,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

impl InventoryStatus {
    pub fn from_model(model: &variant_stock::Model, low_stock_threshold: i32) -> Self {
        let available = model.available();
        Self {
            variant_id: model.variant_id,
            product_id: model.product_id,
            sku: model.sku.clone(),
            on_hand: model.on_hand,
            reserved: model.reserved,
            available,
            is_unlimited: model.is_unlimited,
            is_active: model.is_active,
            is_low_stock: !model.is_unlimited && available <= low_stock_threshold,
            version: model.version,
            updated_at: model.updated_at,
        }
    }
}

/// Read-only projections, optionally served from a short-TTL cache.
///
/// Cache failures degrade to a database read; they never fail the query.
#[derive(Clone)]
pub struct InventoryQueryService {
    db: Arc<DatabaseConnection>,
    cache: Option<Arc<dyn CacheBackend>>,
    cache_ttl: Option<Duration>,
    default_low_stock_threshold: i32,
}

impl InventoryQueryService {
    pub fn new(db: Arc<DatabaseConnection>, default_low_stock_threshold: i32) -> Self {
        Self {
            db,
            cache: None,
            cache_ttl: None,
            default_low_stock_threshold,
        }
    }

    /// Serves status and low-stock reads through `cache`. A `None` TTL
    /// disables caching.
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>, ttl: Option<Duration>) -> Self {
        self.cache = ttl.map(|_| cache);
        self.cache_ttl = ttl;
        self
    }

    #[instrument(skip(self))]
    pub async fn get_inventory_status(&self, variant_id: Uuid) -> Result<InventoryStatus, ServiceError> {
        let key = cache::status_key(variant_id);
        if let Some(status) = self.cached::<InventoryStatus>(&key).await {
            return Ok(status);
        }

        let model = VariantStockRepository::find(self.db.as_ref(), variant_id).await?;
        let status = InventoryStatus::from_model(&model, self.default_low_stock_threshold);
        self.store(&key, &status).await;
        Ok(status)
    }

    /// Active, limited variants whose available quantity is at or below
    /// `threshold` (the configured default when `None`).
    #[instrument(skip(self))]
    pub async fn get_low_stock_products(
        &self,
        threshold: Option<i32>,
    ) -> Result<Vec<InventoryStatus>, ServiceError> {
        let threshold = threshold.unwrap_or(self.default_low_stock_threshold);
        let key = cache::low_stock_key(threshold);
        if let Some(page) = self.cached::<Vec<InventoryStatus>>(&key).await {
            return Ok(page);
        }

        let rows = VariantStockRepository::find_low_stock(self.db.as_ref(), threshold).await?;
        let statuses: Vec<_> = rows
            .iter()
            .map(|m| InventoryStatus::from_model(m, threshold))
            .collect();
        self.store(&key, &statuses).await;
        Ok(statuses)
    }

    /// Newest-first ledger page. Never cached.
    #[instrument(skip(self))]
    pub async fn get_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<TransactionPage, ServiceError> {
        InventoryTransactionRepository::query(self.db.as_ref(), filter).await
    }

    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let cache = self.cache.as_ref()?;
        match cache::get_json::<T>(cache.as_ref(), key).await {
            Ok(hit) => {
                if hit.is_some() {
                    debug!(key, "cache hit");
                }
                hit
            }
            Err(e) => {
                warn!(key, "cache read failed: {}", e);
                None
            }
        }
    }

    async fn store<T: Serialize + Sync>(&self, key: &str, value: &T) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache::set_json(cache.as_ref(), key, value, self.cache_ttl).await {
                warn!(key, "cache write failed: {}", e);
            }
        }
    }
}
