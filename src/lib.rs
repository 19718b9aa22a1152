//! Stock Ledger
//!
//! Inventory ledger and reservation engine: on-hand/reserved bookkeeping per
//! variant, an append-only transaction ledger, order-linked reservations,
//! bulk corrections and drift reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod audit;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod lock;
pub mod metrics;
pub mod migrator;
pub mod models;
pub mod repositories;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::info;

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::cache::{CacheBackend, CacheInvalidationHandler, InMemoryCache};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::outbox::OutboxWorker;
use crate::events::{EventHandler, EventSender, LoggingEventHandler};
use crate::lock::{DistributedLock, InProcessLock, RedisLock};
use crate::repositories::{OrderDirectory, OrderRepository};
use crate::services::{
    BulkOperationService, InventoryQueryService, InventoryService, ReconciliationService,
    ReservationCoordinator, ReservationSweeper,
};

/// Every service of the engine wired against one database pool.
#[derive(Clone)]
pub struct InventoryEngine {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub cache: Arc<dyn CacheBackend>,
    pub inventory: InventoryService,
    pub reservations: ReservationCoordinator,
    pub bulk: BulkOperationService,
    pub reconciliation: ReconciliationService,
    pub queries: InventoryQueryService,
    pub sweeper: ReservationSweeper,
}

impl InventoryEngine {
    /// Connects, migrates when `auto_migrate` is set, and picks the Redis
    /// lock when a Redis URL is configured.
    pub async fn connect(config: AppConfig) -> Result<Self, ServiceError> {
        let db = Arc::new(db::establish_connection_from_app_config(&config).await?);
        if config.auto_migrate {
            db::run_migrations(&db).await?;
        }

        let lock: Arc<dyn DistributedLock> = match config.redis_url.as_deref() {
            Some(url) => {
                info!("using redis for reconciliation locks");
                Arc::new(RedisLock::from_url(url)?)
            }
            None => Arc::new(InProcessLock::new()),
        };

        Ok(Self::from_parts(db, config, lock, Arc::new(TracingAuditLogger)))
    }

    pub fn from_parts(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        lock: Arc<dyn DistributedLock>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        let settings = &config.inventory;
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
        let orders: Arc<dyn OrderDirectory> = Arc::new(OrderRepository::new(db.clone()));

        let inventory = InventoryService::new(db.clone(), audit.clone());
        let reservations = ReservationCoordinator::new(db.clone(), orders.clone(), audit.clone());
        let bulk = BulkOperationService::new(inventory.clone(), settings.bulk_max_items);
        let reconciliation = ReconciliationService::new(db.clone(), lock, audit, settings);
        let queries = InventoryQueryService::new(db.clone(), settings.default_low_stock_threshold)
            .with_cache(cache.clone(), settings.cache_ttl());
        let sweeper = ReservationSweeper::new(Arc::new(reservations.clone()), orders, settings);

        Self {
            db,
            config,
            cache,
            inventory,
            reservations,
            bulk,
            reconciliation,
            queries,
            sweeper,
        }
    }

    /// Outbox worker publishing into an in-process channel.
    pub fn outbox_worker(&self, sender: EventSender) -> OutboxWorker {
        OutboxWorker::new(self.db.clone(), sender, self.config.outbox.clone())
    }

    /// Outbox worker that acknowledges rows only after `handlers` ran.
    pub fn outbox_worker_with_handlers(&self, handlers: Vec<Arc<dyn EventHandler>>) -> OutboxWorker {
        OutboxWorker::with_handlers(self.db.clone(), handlers, self.config.outbox.clone())
    }

    pub fn cache_invalidation_handler(&self) -> CacheInvalidationHandler {
        CacheInvalidationHandler::new(self.cache.clone())
    }

    /// Cache invalidation plus event logging.
    pub fn event_handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        vec![
            Arc::new(self.cache_invalidation_handler()),
            Arc::new(LoggingEventHandler),
        ]
    }
}
