//! Bulk stock corrections with per-item isolation.
//!
//! Each item runs in its own unit of work, so a failing item neither undoes
//! the items before it nor blocks the ones after it.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::MAX_BULK_ITEMS;
use crate::errors::ServiceError;
use crate::models::StockMutation;
use crate::services::inventory::{require_notes, InventoryService, MutationContext, StockChange};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAdjustItem {
    pub variant_id: Uuid,
    pub quantity_change: i32,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkStockInItem {
    pub variant_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub index: usize,
    pub variant_id: Uuid,
    pub success: bool,
    pub new_on_hand: Option<i32>,
    pub available: Option<i32>,
    pub ledger_entry_id: Option<i64>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl BulkItemResult {
    fn from_result(index: usize, variant_id: Uuid, result: Result<StockChange, ServiceError>) -> Self {
        match result {
            Ok(change) => Self {
                index,
                variant_id,
                success: true,
                new_on_hand: Some(change.on_hand),
                available: Some(change.available),
                ledger_entry_id: Some(change.ledger_entry_id),
                error: None,
                error_code: None,
            },
            Err(e) => Self {
                index,
                variant_id,
                success: false,
                new_on_hand: None,
                available: None,
                ledger_entry_id: None,
                error: Some(e.to_string()),
                error_code: Some(e.code().to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub total_requested: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub results: Vec<BulkItemResult>,
}

impl BulkOperationResult {
    fn from_items(results: Vec<BulkItemResult>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            total_requested: results.len(),
            success_count,
            failed_count: results.len() - success_count,
            results,
        }
    }
}

#[derive(Clone)]
pub struct BulkOperationService {
    inventory: InventoryService,
    max_items: usize,
}

impl BulkOperationService {
    pub fn new(inventory: InventoryService, max_items: usize) -> Self {
        Self {
            inventory,
            max_items: max_items.clamp(1, MAX_BULK_ITEMS),
        }
    }

    fn check_batch_size(&self, len: usize) -> Result<(), ServiceError> {
        if len == 0 || len > self.max_items {
            return Err(ServiceError::ValidationError(format!(
                "bulk operations accept 1 to {} items, got {}",
                self.max_items, len
            )));
        }
        Ok(())
    }

    /// Applies signed adjustments item by item.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn bulk_adjust_stock(
        &self,
        items: Vec<BulkAdjustItem>,
        user_id: Option<Uuid>,
    ) -> Result<BulkOperationResult, ServiceError> {
        self.check_batch_size(items.len())?;

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let outcome = match require_notes(&item.notes, "bulk adjustment") {
                Ok(()) => {
                    self.inventory
                        .apply_mutation(
                            item.variant_id,
                            StockMutation::Adjust(item.quantity_change),
                            MutationContext::new(user_id, item.notes),
                        )
                        .await
                }
                Err(e) => Err(e),
            };
            results.push(BulkItemResult::from_result(index, item.variant_id, outcome));
        }

        let result = BulkOperationResult::from_items(results);
        info!(
            total = result.total_requested,
            succeeded = result.success_count,
            failed = result.failed_count,
            "bulk adjustment finished"
        );
        Ok(result)
    }

    /// Receives supplier stock; `supplier_reference` tags every ledger entry.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn bulk_stock_in(
        &self,
        items: Vec<BulkStockInItem>,
        user_id: Option<Uuid>,
        supplier_reference: Option<String>,
    ) -> Result<BulkOperationResult, ServiceError> {
        self.check_batch_size(items.len())?;
        let supplier_reference = supplier_reference.filter(|r| !r.trim().is_empty());

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let notes = item.notes.unwrap_or_else(|| match &supplier_reference {
                Some(reference) => format!("received from supplier ({})", reference),
                None => "received from supplier".to_string(),
            });
            let ctx = MutationContext::new(user_id, notes).with_reference(supplier_reference.clone());
            let outcome = self
                .inventory
                .apply_mutation(item.variant_id, StockMutation::AddStock(item.quantity), ctx)
                .await;
            results.push(BulkItemResult::from_result(index, item.variant_id, outcome));
        }

        let result = BulkOperationResult::from_items(results);
        info!(
            total = result.total_requested,
            succeeded = result.success_count,
            failed = result.failed_count,
            supplier_reference = ?supplier_reference,
            "bulk stock-in finished"
        );
        Ok(result)
    }
}
