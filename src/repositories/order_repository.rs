use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Query, SelectStatement};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::inventory_transaction::{self, TransactionType};
use crate::entities::order::{Column, Entity as Order, Model as OrderModel};
use crate::entities::order_item::{self, Entity as OrderItem, Model as OrderItemModel};
use crate::errors::ServiceError;

pub const STATUS_PENDING_PAYMENT: &str = "pending_payment";
pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_COMPLETED: &str = "completed";

/// Order states from which stock may be returned to the warehouse.
pub const RETURNABLE_STATUSES: [&str; 2] = [STATUS_DELIVERED, STATUS_COMPLETED];

/// Read-only view of the order subsystem.
#[async_trait]
pub trait OrderDirectory: Send + Sync {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderModel>, ServiceError>;

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItemModel>, ServiceError>;

    /// Ids of orders still awaiting payment, created before `cutoff`, that
    /// hold at least one reservation no commit or release has settled.
    /// Oldest first.
    async fn expired_pending_orders(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError>;
}

/// `order_id`s of items with a `reservation` entry and no settling entry.
fn orders_with_live_reservations() -> SelectStatement {
    let settled_items = Query::select()
        .column(inventory_transaction::Column::OrderItemId)
        .from(inventory_transaction::Entity)
        .and_where(inventory_transaction::Column::OrderItemId.is_not_null())
        .and_where(inventory_transaction::Column::TransactionType.is_in([
            TransactionType::Commit.as_str(),
            TransactionType::ReservationRelease.as_str(),
        ]))
        .to_owned();

    Query::select()
        .column((order_item::Entity, order_item::Column::OrderId))
        .from(order_item::Entity)
        .inner_join(
            inventory_transaction::Entity,
            Expr::col((
                inventory_transaction::Entity,
                inventory_transaction::Column::OrderItemId,
            ))
            .equals((order_item::Entity, order_item::Column::Id)),
        )
        .and_where(
            Expr::col((
                inventory_transaction::Entity,
                inventory_transaction::Column::TransactionType,
            ))
            .eq(TransactionType::Reservation.as_str()),
        )
        .and_where(
            Expr::col((order_item::Entity, order_item::Column::Id)).not_in_subquery(settled_items),
        )
        .to_owned()
}

/// Repository for order operations
#[derive(Debug, Clone)]
pub struct OrderRepository {
    db: Arc<DatabaseConnection>,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OrderDirectory for OrderRepository {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<OrderModel>, ServiceError> {
        Order::find_by_id(order_id)
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderItemModel>, ServiceError> {
        OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::Id)
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    async fn expired_pending_orders(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, ServiceError> {
        Order::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(STATUS_PENDING_PAYMENT))
            .filter(Column::CreatedAt.lt(cutoff))
            .filter(Column::Id.in_subquery(orders_with_live_reservations()))
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .into_tuple()
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)
    }
}
