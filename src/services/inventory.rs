use chrono::Utc;
use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditLogger, AuditRecord};
use crate::db::transaction::{begin, finish_unit_of_work};
use crate::entities::inventory_transaction::TransactionType;
use crate::entities::variant_stock;
use crate::errors::ServiceError;
use crate::events::{outbox, InventoryEvent, AGGREGATE_VARIANT_STOCK};
use crate::metrics;
use crate::models::{StockLevel, StockMutation};
use crate::repositories::{InventoryTransactionRepository, NewLedgerEntry, VariantStockRepository};

/// Who asked for a mutation and why.
#[derive(Debug, Clone, Default)]
pub struct MutationContext {
    pub user_id: Option<Uuid>,
    pub order_item_id: Option<Uuid>,
    pub notes: String,
    pub reference_number: Option<String>,
}

impl MutationContext {
    pub fn new(user_id: Option<Uuid>, notes: impl Into<String>) -> Self {
        Self {
            user_id,
            notes: notes.into(),
            ..Default::default()
        }
    }

    pub fn for_order_item(order_item_id: Uuid, notes: impl Into<String>) -> Self {
        Self {
            order_item_id: Some(order_item_id),
            notes: notes.into(),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, reference_number: Option<String>) -> Self {
        self.reference_number = reference_number;
        self
    }
}

/// Committed result of one stock mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChange {
    pub variant_id: Uuid,
    pub transaction_type: TransactionType,
    pub quantity_delta: i32,
    pub reserved_delta: i32,
    pub on_hand: i32,
    pub reserved: i32,
    pub available: i32,
    pub version: i32,
    pub ledger_entry_id: i64,
}

/// A mutation written inside an open unit of work, not yet committed.
#[derive(Debug, Clone)]
pub(crate) struct AppliedMutation {
    pub change: StockChange,
    pub audit: AuditRecord,
}

/// Validates `mutation` against `current` and writes the counters, the ledger
/// entry and the outbox row on `conn`.
///
/// `current` must have been loaded on the same connection; the conditional
/// write fails with `ConcurrencyConflict` if its version is stale.
pub(crate) async fn apply_loaded<C: ConnectionTrait>(
    conn: &C,
    current: &variant_stock::Model,
    mutation: StockMutation,
    ctx: &MutationContext,
) -> Result<AppliedMutation, ServiceError> {
    let before = StockLevel::from(current);
    let (quantity_delta, reserved_delta) = mutation.deltas();
    let transition = before.apply(mutation).map_err(|e| {
        warn!(
            variant_id = %current.variant_id,
            kind = mutation.kind(),
            delta = quantity_delta,
            reserved_delta,
            on_hand = before.on_hand,
            reserved = before.reserved,
            would_be_on_hand = before.on_hand.saturating_add(quantity_delta),
            would_be_reserved = before.reserved.saturating_add(reserved_delta),
            "stock mutation rejected: {}",
            e
        );
        e
    })?;

    let updated = VariantStockRepository::write_counters(conn, current, transition.after).await?;

    let entry = InventoryTransactionRepository::log_transaction(
        conn,
        NewLedgerEntry {
            variant_id: current.variant_id,
            transaction_type: mutation.transaction_type(),
            quantity_delta: transition.quantity_delta,
            reserved_delta: transition.reserved_delta,
            stock_before: transition.before.on_hand,
            stock_after: transition.after.on_hand,
            order_item_id: ctx.order_item_id,
            user_id: ctx.user_id,
            notes: ctx.notes.clone(),
            reference_number: ctx.reference_number.clone(),
        },
    )
    .await?;

    outbox::enqueue(
        conn,
        AGGREGATE_VARIANT_STOCK,
        Some(current.variant_id),
        &InventoryEvent::StockChanged {
            variant_id: current.variant_id,
            product_id: current.product_id,
            delta: transition.quantity_delta,
            reserved_delta: transition.reserved_delta,
            transaction_type: mutation.transaction_type(),
            on_hand: updated.on_hand,
            reserved: updated.reserved,
        },
    )
    .await?;

    let change = StockChange {
        variant_id: current.variant_id,
        transaction_type: mutation.transaction_type(),
        quantity_delta: transition.quantity_delta,
        reserved_delta: transition.reserved_delta,
        on_hand: updated.on_hand,
        reserved: updated.reserved,
        available: updated.available(),
        version: updated.version,
        ledger_entry_id: entry.id,
    };
    let audit = AuditRecord {
        action: mutation.kind().to_string(),
        variant_id: current.variant_id,
        user_id: ctx.user_id,
        quantity_delta: transition.quantity_delta,
        reserved_delta: transition.reserved_delta,
        stock_before: transition.before.on_hand,
        stock_after: transition.after.on_hand,
        ledger_entry_id: Some(entry.id),
        notes: ctx.notes.clone(),
        recorded_at: Utc::now(),
    };
    Ok(AppliedMutation { change, audit })
}

pub(crate) async fn apply_stock_mutation<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    mutation: StockMutation,
    ctx: &MutationContext,
) -> Result<AppliedMutation, ServiceError> {
    mutation.validate()?;
    let current = VariantStockRepository::find(conn, variant_id).await?;
    apply_loaded(conn, &current, mutation, ctx).await
}

/// After-commit side effects: metrics and the audit narrative.
pub(crate) async fn publish_committed(audit: &dyn AuditLogger, applied: Vec<AppliedMutation>) {
    for item in applied {
        metrics::record_mutation(item.change.transaction_type.as_str());
        audit.record(item.audit).await;
    }
}

pub(crate) fn require_notes(notes: &str, what: &str) -> Result<(), ServiceError> {
    if notes.trim().is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "{} requires notes",
            what
        )));
    }
    Ok(())
}

/// Variant stock aggregate: every operation is one atomic read, validate,
/// conditional-write cycle that also appends a ledger entry and an outbox row.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    audit: Arc<dyn AuditLogger>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, audit: Arc<dyn AuditLogger>) -> Self {
        Self { db, audit }
    }

    pub fn db(&self) -> &Arc<DatabaseConnection> {
        &self.db
    }

    pub fn audit(&self) -> &Arc<dyn AuditLogger> {
        &self.audit
    }

    /// Creates the zeroed stock record for a new variant. Calling it again for
    /// an existing variant returns the stored record untouched.
    #[instrument(skip(self))]
    pub async fn create_variant_stock(
        &self,
        variant_id: Uuid,
        product_id: Uuid,
        sku: &str,
        is_unlimited: bool,
    ) -> Result<variant_stock::Model, ServiceError> {
        if sku.trim().is_empty() {
            return Err(ServiceError::ValidationError("sku must not be empty".into()));
        }
        if let Some(existing) =
            VariantStockRepository::find_optional(self.db.as_ref(), variant_id).await?
        {
            return Ok(existing);
        }
        let created =
            VariantStockRepository::insert(self.db.as_ref(), variant_id, product_id, sku, is_unlimited)
                .await?;
        info!(%variant_id, %product_id, sku, is_unlimited, "variant stock created");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn set_unlimited(
        &self,
        variant_id: Uuid,
        is_unlimited: bool,
    ) -> Result<variant_stock::Model, ServiceError> {
        self.update_flags(variant_id, Some(is_unlimited), None).await
    }

    #[instrument(skip(self))]
    pub async fn set_active(
        &self,
        variant_id: Uuid,
        is_active: bool,
    ) -> Result<variant_stock::Model, ServiceError> {
        self.update_flags(variant_id, None, Some(is_active)).await
    }

    /// Version-checked flag toggle. Counters do not move, so no ledger entry.
    async fn update_flags(
        &self,
        variant_id: Uuid,
        is_unlimited: Option<bool>,
        is_active: Option<bool>,
    ) -> Result<variant_stock::Model, ServiceError> {
        let txn = begin(&self.db).await?;
        let result: Result<variant_stock::Model, ServiceError> = async {
            let current = VariantStockRepository::find(&txn, variant_id).await?;
            let is_unlimited = is_unlimited.unwrap_or(current.is_unlimited);
            let is_active = is_active.unwrap_or(current.is_active);
            if !is_unlimited && (current.on_hand < current.reserved || current.reserved < 0) {
                return Err(ServiceError::InvalidOperation(format!(
                    "cannot limit variant {}: on-hand {} does not cover reserved {}",
                    variant_id, current.on_hand, current.reserved
                )));
            }
            let updated =
                VariantStockRepository::write_flags(&txn, &current, is_unlimited, is_active).await?;
            outbox::enqueue(
                &txn,
                AGGREGATE_VARIANT_STOCK,
                Some(variant_id),
                &InventoryEvent::VariantFlagsChanged {
                    variant_id,
                    product_id: updated.product_id,
                    is_unlimited,
                    is_active,
                },
            )
            .await?;
            Ok(updated)
        }
        .await;
        let updated = finish_unit_of_work(txn, result).await?;
        info!(
            %variant_id,
            is_unlimited = updated.is_unlimited,
            is_active = updated.is_active,
            "variant flags updated"
        );
        Ok(updated)
    }

    /// Runs one mutation in its own unit of work.
    pub async fn apply_mutation(
        &self,
        variant_id: Uuid,
        mutation: StockMutation,
        ctx: MutationContext,
    ) -> Result<StockChange, ServiceError> {
        let result = self.apply_in_unit_of_work(variant_id, mutation, &ctx).await;
        match result {
            Ok(applied) => {
                let change = applied.change.clone();
                info!(
                    %variant_id,
                    kind = mutation.kind(),
                    delta = change.quantity_delta,
                    reserved_delta = change.reserved_delta,
                    on_hand = change.on_hand,
                    reserved = change.reserved,
                    ledger_entry_id = change.ledger_entry_id,
                    "stock mutation committed"
                );
                publish_committed(self.audit.as_ref(), vec![applied]).await;
                Ok(change)
            }
            Err(e) => {
                metrics::record_failure(&e);
                warn!(
                    %variant_id,
                    kind = mutation.kind(),
                    code = e.code(),
                    "stock mutation failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn apply_in_unit_of_work(
        &self,
        variant_id: Uuid,
        mutation: StockMutation,
        ctx: &MutationContext,
    ) -> Result<AppliedMutation, ServiceError> {
        // Input errors never reach storage.
        mutation.validate()?;
        let txn = begin(&self.db).await?;
        let result = apply_stock_mutation(&txn, variant_id, mutation, ctx).await;
        finish_unit_of_work(txn, result).await
    }

    #[instrument(skip(self, notes))]
    pub async fn add_stock(
        &self,
        variant_id: Uuid,
        quantity: i32,
        user_id: Option<Uuid>,
        notes: &str,
    ) -> Result<StockChange, ServiceError> {
        self.apply_mutation(
            variant_id,
            StockMutation::AddStock(quantity),
            MutationContext::new(user_id, notes),
        )
        .await
    }

    #[instrument(skip(self, notes))]
    pub async fn remove_stock(
        &self,
        variant_id: Uuid,
        quantity: i32,
        user_id: Option<Uuid>,
        notes: &str,
    ) -> Result<StockChange, ServiceError> {
        self.apply_mutation(
            variant_id,
            StockMutation::RemoveStock(quantity),
            MutationContext::new(user_id, notes),
        )
        .await
    }

    /// Signed manual correction; fails if it would leave on-hand below reserved.
    #[instrument(skip(self, notes))]
    pub async fn adjust_stock(
        &self,
        variant_id: Uuid,
        delta: i32,
        user_id: Option<Uuid>,
        notes: &str,
    ) -> Result<StockChange, ServiceError> {
        require_notes(notes, "stock adjustment")?;
        self.apply_mutation(
            variant_id,
            StockMutation::Adjust(delta),
            MutationContext::new(user_id, notes),
        )
        .await
    }

    #[instrument(skip(self, notes))]
    pub async fn record_damage(
        &self,
        variant_id: Uuid,
        quantity: i32,
        user_id: Option<Uuid>,
        notes: &str,
    ) -> Result<StockChange, ServiceError> {
        require_notes(notes, "damage record")?;
        self.apply_mutation(
            variant_id,
            StockMutation::Damage(quantity),
            MutationContext::new(user_id, notes),
        )
        .await
    }

    /// Holds stock without tying it to an order item. Order-linked holds go
    /// through `ReservationCoordinator`, which keys them off the item id.
    #[instrument(skip(self))]
    pub async fn reserve(&self, variant_id: Uuid, quantity: i32) -> Result<StockChange, ServiceError> {
        self.apply_mutation(
            variant_id,
            StockMutation::Reserve(quantity),
            MutationContext::new(None, "reservation"),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn release_reservation(&self, variant_id: Uuid, quantity: i32) -> Result<StockChange, ServiceError> {
        self.apply_mutation(
            variant_id,
            StockMutation::Release(quantity),
            MutationContext::new(None, "reservation released"),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn commit_reservation(&self, variant_id: Uuid, quantity: i32) -> Result<StockChange, ServiceError> {
        self.apply_mutation(
            variant_id,
            StockMutation::Commit(quantity),
            MutationContext::new(None, "reservation committed"),
        )
        .await
    }

    #[instrument(skip(self, reason))]
    pub async fn return_stock(
        &self,
        variant_id: Uuid,
        quantity: i32,
        user_id: Option<Uuid>,
        reason: &str,
    ) -> Result<StockChange, ServiceError> {
        require_notes(reason, "stock return")?;
        self.apply_mutation(
            variant_id,
            StockMutation::Return(quantity),
            MutationContext::new(user_id, reason),
        )
        .await
    }
}
