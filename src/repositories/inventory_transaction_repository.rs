use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Select, Set,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::entities::inventory_transaction::{
    self, Column, Entity as InventoryTransaction, Model, TransactionType,
};
use crate::errors::ServiceError;

pub const MAX_PAGE_SIZE: u64 = 200;

/// Everything needed to append one ledger entry.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub variant_id: Uuid,
    pub transaction_type: TransactionType,
    pub quantity_delta: i32,
    pub reserved_delta: i32,
    pub stock_before: i32,
    pub stock_after: i32,
    pub order_item_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub notes: String,
    pub reference_number: Option<String>,
}

/// Ledger query; all criteria are optional and combined with AND.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransactionFilter {
    pub variant_id: Option<Uuid>,
    pub transaction_type: Option<TransactionType>,
    pub order_item_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[validate(range(min = 1))]
    pub page: u64,
    #[validate(range(min = 1, max = 200))]
    pub per_page: u64,
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self {
            variant_id: None,
            transaction_type: None,
            order_item_id: None,
            from: None,
            to: None,
            page: 1,
            per_page: 50,
        }
    }
}

impl TransactionFilter {
    pub fn for_variant(variant_id: Uuid) -> Self {
        Self {
            variant_id: Some(variant_id),
            ..Default::default()
        }
    }

    fn apply(&self, mut query: Select<InventoryTransaction>) -> Select<InventoryTransaction> {
        if let Some(variant_id) = self.variant_id {
            query = query.filter(Column::VariantId.eq(variant_id));
        }
        if let Some(kind) = self.transaction_type {
            query = query.filter(Column::TransactionType.eq(kind.as_str()));
        }
        if let Some(order_item_id) = self.order_item_id {
            query = query.filter(Column::OrderItemId.eq(order_item_id));
        }
        if let Some(from) = self.from {
            query = query.filter(Column::CreatedAt.gte(from));
        }
        if let Some(to) = self.to {
            query = query.filter(Column::CreatedAt.lte(to));
        }
        query
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPage {
    pub items: Vec<Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Append-only access to `inventory_transactions`. There is deliberately no
/// update or delete.
#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryTransactionRepository;

impl InventoryTransactionRepository {
    /// Appends one entry. Must run on the same transaction as the counter write.
    pub async fn log_transaction<C: ConnectionTrait>(
        conn: &C,
        entry: NewLedgerEntry,
    ) -> Result<Model, ServiceError> {
        inventory_transaction::ActiveModel {
            variant_id: Set(entry.variant_id),
            transaction_type: Set(entry.transaction_type.as_str().to_string()),
            quantity_delta: Set(entry.quantity_delta),
            reserved_delta: Set(entry.reserved_delta),
            stock_before: Set(entry.stock_before),
            stock_after: Set(entry.stock_after),
            order_item_id: Set(entry.order_item_id),
            user_id: Set(entry.user_id),
            notes: Set(entry.notes),
            reference_number: Set(entry.reference_number),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    /// Σ quantity_delta for a variant, i.e. the ledger-derived on-hand.
    pub async fn sum_deltas<C: ConnectionTrait>(
        conn: &C,
        variant_id: Uuid,
    ) -> Result<i64, ServiceError> {
        let total: Option<Option<i64>> = InventoryTransaction::find()
            .select_only()
            .column_as(Column::QuantityDelta.sum(), "total")
            .filter(Column::VariantId.eq(variant_id))
            .into_tuple()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(total.flatten().unwrap_or(0))
    }

    /// All entries recorded against an order item, oldest first.
    pub async fn find_for_order_item<C: ConnectionTrait>(
        conn: &C,
        order_item_id: Uuid,
    ) -> Result<Vec<Model>, ServiceError> {
        InventoryTransaction::find()
            .filter(Column::OrderItemId.eq(order_item_id))
            .order_by_asc(Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn count_for_variant<C: ConnectionTrait>(
        conn: &C,
        variant_id: Uuid,
    ) -> Result<u64, ServiceError> {
        InventoryTransaction::find()
            .filter(Column::VariantId.eq(variant_id))
            .count(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Newest-first page of entries matching `filter`.
    pub async fn query<C: ConnectionTrait>(
        conn: &C,
        filter: &TransactionFilter,
    ) -> Result<TransactionPage, ServiceError> {
        filter.validate()?;

        let paginator = filter
            .apply(InventoryTransaction::find())
            .order_by_desc(Column::Id)
            .paginate(conn, filter.per_page.min(MAX_PAGE_SIZE));

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let items = paginator
            .fetch_page(filter.page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(TransactionPage {
            items,
            total,
            page: filter.page,
            per_page: filter.per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_rejects_oversized_pages() {
        let filter = TransactionFilter {
            per_page: MAX_PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(filter.validate().is_err());

        let filter = TransactionFilter {
            page: 0,
            ..Default::default()
        };
        assert!(filter.validate().is_err());

        assert!(TransactionFilter::default().validate().is_ok());
    }
}
