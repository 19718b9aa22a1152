use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditLogger, AuditRecord};
use crate::config::InventorySettings;
use crate::db::transaction::{begin, finish_unit_of_work};
use crate::entities::inventory_transaction::TransactionType;
use crate::errors::ServiceError;
use crate::events::{outbox, InventoryEvent, AGGREGATE_VARIANT_STOCK};
use crate::lock::{acquire_with_retry, reconcile_lock_key, DistributedLock};
use crate::metrics;
use crate::models::StockLevel;
use crate::repositories::{InventoryTransactionRepository, NewLedgerEntry, VariantStockRepository};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub variant_id: Uuid,
    pub has_discrepancy: bool,
    /// Σ quantity_delta over the variant's ledger
    pub expected: i32,
    pub previous_on_hand: i32,
    /// `expected - previous_on_hand`
    pub difference: i32,
    pub final_stock: i32,
    pub ledger_entry_id: Option<i64>,
}

/// Heals drift between the on-hand counter and the ledger total.
///
/// Runs under a per-variant lock so two administrators cannot reconcile the
/// same variant at once; the counter write is still version-checked.
#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    lock: Arc<dyn DistributedLock>,
    audit: Arc<dyn AuditLogger>,
    lock_ttl: Duration,
    lock_retry_attempts: u32,
    lock_retry_delay: Duration,
}

impl ReconciliationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        lock: Arc<dyn DistributedLock>,
        audit: Arc<dyn AuditLogger>,
        settings: &InventorySettings,
    ) -> Self {
        Self {
            db,
            lock,
            audit,
            lock_ttl: Duration::from_secs(settings.reconcile_lock_ttl_secs),
            lock_retry_attempts: settings.lock_retry_attempts,
            lock_retry_delay: Duration::from_millis(settings.lock_retry_delay_ms),
        }
    }

    #[instrument(skip(self))]
    pub async fn reconcile_stock(
        &self,
        variant_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<ReconciliationReport, ServiceError> {
        let key = reconcile_lock_key(variant_id);
        let guard = acquire_with_retry(
            self.lock.as_ref(),
            &key,
            self.lock_ttl,
            self.lock_retry_attempts,
            self.lock_retry_delay,
        )
        .await?;

        let result = self.reconcile_locked(variant_id, user_id).await;

        match self.lock.release(&guard).await {
            Ok(true) => {}
            Ok(false) => warn!(%variant_id, "reconcile lock expired before release"),
            Err(e) => warn!(%variant_id, "failed to release reconcile lock: {}", e),
        }

        match result {
            Ok((report, audit)) => {
                if let Some(record) = audit {
                    metrics::record_mutation(TransactionType::Reconciliation.as_str());
                    self.audit.record(record).await;
                    warn!(
                        %variant_id,
                        expected = report.expected,
                        previous_on_hand = report.previous_on_hand,
                        difference = report.difference,
                        "stock drift corrected"
                    );
                } else {
                    info!(%variant_id, on_hand = report.final_stock, "no stock drift");
                }
                Ok(report)
            }
            Err(e) => {
                metrics::record_failure(&e);
                warn!(%variant_id, code = e.code(), "reconciliation failed: {}", e);
                Err(e)
            }
        }
    }

    async fn reconcile_locked(
        &self,
        variant_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<(ReconciliationReport, Option<AuditRecord>), ServiceError> {
        let txn = begin(&self.db).await?;
        let result: Result<_, ServiceError> = async {
            let current = VariantStockRepository::find(&txn, variant_id).await?;
            let total = InventoryTransactionRepository::sum_deltas(&txn, variant_id).await?;
            let expected = i32::try_from(total).map_err(|_| {
                ServiceError::InternalError(format!(
                    "ledger total {} for variant {} is out of range",
                    total, variant_id
                ))
            })?;
            let difference = expected.checked_sub(current.on_hand).ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "difference between ledger total {} and on-hand {} for variant {} is out of range",
                    expected, current.on_hand, variant_id
                ))
            })?;

            if difference == 0 {
                return Ok((
                    ReconciliationReport {
                        variant_id,
                        has_discrepancy: false,
                        expected,
                        previous_on_hand: current.on_hand,
                        difference: 0,
                        final_stock: current.on_hand,
                        ledger_entry_id: None,
                    },
                    None,
                ));
            }

            let target = StockLevel::from(&current).reconcile_to(expected)?;
            let updated = VariantStockRepository::write_counters(&txn, &current, target).await?;
            let notes = format!(
                "reconciled on-hand {} to ledger total {} (difference {:+})",
                current.on_hand, expected, difference
            );
            // Zero delta: the ledger total already equals `expected`.
            let entry = InventoryTransactionRepository::log_transaction(
                &txn,
                NewLedgerEntry {
                    variant_id,
                    transaction_type: TransactionType::Reconciliation,
                    quantity_delta: 0,
                    reserved_delta: 0,
                    stock_before: current.on_hand,
                    stock_after: expected,
                    order_item_id: None,
                    user_id,
                    notes: notes.clone(),
                    reference_number: None,
                },
            )
            .await?;
            outbox::enqueue(
                &txn,
                AGGREGATE_VARIANT_STOCK,
                Some(variant_id),
                &InventoryEvent::StockChanged {
                    variant_id,
                    product_id: current.product_id,
                    delta: difference,
                    reserved_delta: 0,
                    transaction_type: TransactionType::Reconciliation,
                    on_hand: updated.on_hand,
                    reserved: updated.reserved,
                },
            )
            .await?;

            let report = ReconciliationReport {
                variant_id,
                has_discrepancy: true,
                expected,
                previous_on_hand: current.on_hand,
                difference,
                final_stock: updated.on_hand,
                ledger_entry_id: Some(entry.id),
            };
            let audit = AuditRecord {
                action: TransactionType::Reconciliation.as_str().to_string(),
                variant_id,
                user_id,
                quantity_delta: 0,
                reserved_delta: 0,
                stock_before: current.on_hand,
                stock_after: expected,
                ledger_entry_id: Some(entry.id),
                notes,
                recorded_at: Utc::now(),
            };
            Ok((report, Some(audit)))
        }
        .await;
        finish_unit_of_work(txn, result).await
    }
}
