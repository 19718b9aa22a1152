use chrono::Utc;
use sea_orm::sea_query::{Expr, Order};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::entities::variant_stock::{self, Column, Entity as VariantStock, Model};
use crate::errors::ServiceError;
use crate::models::StockLevel;

/// Load and version-checked write of variant stock counters.
///
/// Every method takes a connection so callers can run it on the pool or
/// inside an open unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantStockRepository;

impl VariantStockRepository {
    pub async fn find_optional<C: ConnectionTrait>(
        conn: &C,
        variant_id: Uuid,
    ) -> Result<Option<Model>, ServiceError> {
        VariantStock::find_by_id(variant_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find<C: ConnectionTrait>(conn: &C, variant_id: Uuid) -> Result<Model, ServiceError> {
        Self::find_optional(conn, variant_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("variant {}", variant_id)))
    }

    pub async fn insert<C: ConnectionTrait>(
        conn: &C,
        variant_id: Uuid,
        product_id: Uuid,
        sku: &str,
        is_unlimited: bool,
    ) -> Result<Model, ServiceError> {
        variant_stock::ActiveModel {
            variant_id: Set(variant_id),
            product_id: Set(product_id),
            sku: Set(sku.to_string()),
            on_hand: Set(0),
            reserved: Set(0),
            is_unlimited: Set(is_unlimited),
            is_active: Set(true),
            version: Set(0),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    /// Writes `level` only if the row still carries `current.version`.
    ///
    /// Zero affected rows means another unit of work got there first.
    pub async fn write_counters<C: ConnectionTrait>(
        conn: &C,
        current: &Model,
        level: StockLevel,
    ) -> Result<Model, ServiceError> {
        let now = Utc::now();
        let next_version = current.version.wrapping_add(1);
        let result = VariantStock::update_many()
            .col_expr(Column::OnHand, Expr::value(level.on_hand))
            .col_expr(Column::Reserved, Expr::value(level.reserved))
            .col_expr(Column::Version, Expr::value(next_version))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::VariantId.eq(current.variant_id))
            .filter(Column::Version.eq(current.version))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrencyConflict(current.variant_id));
        }

        Ok(Model {
            on_hand: level.on_hand,
            reserved: level.reserved,
            version: next_version,
            updated_at: now,
            ..current.clone()
        })
    }

    /// Version-checked flag toggle; counters are left alone.
    pub async fn write_flags<C: ConnectionTrait>(
        conn: &C,
        current: &Model,
        is_unlimited: bool,
        is_active: bool,
    ) -> Result<Model, ServiceError> {
        let now = Utc::now();
        let next_version = current.version.wrapping_add(1);
        let result = VariantStock::update_many()
            .col_expr(Column::IsUnlimited, Expr::value(is_unlimited))
            .col_expr(Column::IsActive, Expr::value(is_active))
            .col_expr(Column::Version, Expr::value(next_version))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::VariantId.eq(current.variant_id))
            .filter(Column::Version.eq(current.version))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrencyConflict(current.variant_id));
        }

        Ok(Model {
            is_unlimited,
            is_active,
            version: next_version,
            updated_at: now,
            ..current.clone()
        })
    }

    /// Active, limited variants whose available quantity is at or below `threshold`,
    /// lowest availability first.
    pub async fn find_low_stock<C: ConnectionTrait>(
        conn: &C,
        threshold: i32,
    ) -> Result<Vec<Model>, ServiceError> {
        let available = Expr::col(Column::OnHand).sub(Expr::col(Column::Reserved));
        VariantStock::find()
            .filter(Column::IsActive.eq(true))
            .filter(Column::IsUnlimited.eq(false))
            .filter(Expr::expr(available.clone()).lte(threshold))
            .order_by(available, Order::Asc)
            .order_by_asc(Column::Sku)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }
}
