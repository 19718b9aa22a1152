#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use stock_ledger::audit::MemoryAuditLogger;
use stock_ledger::config::AppConfig;
use stock_ledger::db;
use stock_ledger::entities::{inventory_transaction, order, order_item, variant_stock};
use stock_ledger::lock::InProcessLock;
use stock_ledger::InventoryEngine;
use uuid::Uuid;

/// Engine over a fresh in-memory SQLite database.
pub struct TestEngine {
    pub engine: InventoryEngine,
    pub audit: Arc<MemoryAuditLogger>,
    pub lock: Arc<InProcessLock>,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::for_database("sqlite::memory:")).await
    }

    pub async fn with_config(mut cfg: AppConfig) -> Self {
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.inventory.lock_retry_attempts = 2;
        cfg.inventory.lock_retry_delay_ms = 10;
        cfg.inventory.conflict_retry_base_delay_ms = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("db connect");
        db::run_migrations(&pool).await.expect("migrations");

        let audit = Arc::new(MemoryAuditLogger::new());
        let lock = Arc::new(InProcessLock::new());
        let engine = InventoryEngine::from_parts(Arc::new(pool), cfg, lock.clone(), audit.clone());
        Self {
            engine,
            audit,
            lock,
        }
    }

    /// Creates a limited variant and receives `on_hand` units through the ledger.
    pub async fn variant(&self, on_hand: i32) -> Uuid {
        self.variant_with(on_hand, false).await
    }

    pub async fn variant_with(&self, on_hand: i32, is_unlimited: bool) -> Uuid {
        let variant_id = Uuid::new_v4();
        let sku = format!("SKU-{}", &variant_id.simple().to_string()[..8]);
        self.engine
            .inventory
            .create_variant_stock(variant_id, Uuid::new_v4(), &sku, is_unlimited)
            .await
            .expect("create variant");
        if on_hand > 0 {
            self.engine
                .inventory
                .add_stock(variant_id, on_hand, None, "initial receipt")
                .await
                .expect("seed stock");
        }
        variant_id
    }

    /// Inserts an order owned by the order subsystem, created `age` ago.
    /// Returns the order id and the item ids in the order given.
    pub async fn order(
        &self,
        status: &str,
        age: chrono::Duration,
        items: &[(Uuid, i32)],
    ) -> (Uuid, Vec<Uuid>) {
        let order_id = Uuid::new_v4();
        order::ActiveModel {
            id: Set(order_id),
            status: Set(status.to_string()),
            created_at: Set(Utc::now() - age),
            updated_at: Set(None),
        }
        .insert(self.engine.db.as_ref())
        .await
        .expect("insert order");

        let mut item_ids = Vec::with_capacity(items.len());
        for (variant_id, quantity) in items {
            let item_id = Uuid::new_v4();
            order_item::ActiveModel {
                id: Set(item_id),
                order_id: Set(order_id),
                variant_id: Set(*variant_id),
                quantity: Set(*quantity),
            }
            .insert(self.engine.db.as_ref())
            .await
            .expect("insert order item");
            item_ids.push(item_id);
        }
        (order_id, item_ids)
    }

    pub async fn set_order_status(&self, order_id: Uuid, status: &str) {
        order::ActiveModel {
            id: Set(order_id),
            status: Set(status.to_string()),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .update(self.engine.db.as_ref())
        .await
        .expect("update order status");
    }

    pub async fn stock(&self, variant_id: Uuid) -> variant_stock::Model {
        variant_stock::Entity::find_by_id(variant_id)
            .one(self.engine.db.as_ref())
            .await
            .expect("load variant")
            .expect("variant exists")
    }

    /// Ledger entries of a variant, oldest first.
    pub async fn ledger(&self, variant_id: Uuid) -> Vec<inventory_transaction::Model> {
        inventory_transaction::Entity::find()
            .filter(inventory_transaction::Column::VariantId.eq(variant_id))
            .order_by_asc(inventory_transaction::Column::Id)
            .all(self.engine.db.as_ref())
            .await
            .expect("load ledger")
    }

    pub async fn ledger_sum(&self, variant_id: Uuid) -> i32 {
        self.ledger(variant_id)
            .await
            .iter()
            .map(|e| e.quantity_delta)
            .sum()
    }

    pub async fn assert_consistent(&self, variant_id: Uuid) {
        let stock = self.stock(variant_id).await;
        assert_eq!(
            self.ledger_sum(variant_id).await,
            stock.on_hand,
            "ledger total must equal on-hand"
        );
        if !stock.is_unlimited {
            assert!(stock.reserved >= 0 && stock.reserved <= stock.on_hand);
        }
    }
}
