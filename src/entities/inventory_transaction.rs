use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter as StrumEnumIter, EnumString};

/// Kinds of ledger entries
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    StrumEnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionType {
    StockIn,
    StockOut,
    Reservation,
    ReservationRelease,
    Commit,
    Damage,
    Adjustment,
    Reconciliation,
    Return,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::StockIn => "stock_in",
            TransactionType::StockOut => "stock_out",
            TransactionType::Reservation => "reservation",
            TransactionType::ReservationRelease => "reservation_release",
            TransactionType::Commit => "commit",
            TransactionType::Damage => "damage",
            TransactionType::Adjustment => "adjustment",
            TransactionType::Reconciliation => "reconciliation",
            TransactionType::Return => "return",
        }
    }

    /// Entries that settle a reservation for an order item.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionType::Commit | TransactionType::ReservationRelease
        )
    }
}

/// One immutable ledger entry.
///
/// `quantity_delta` is the signed change to on-hand and `reserved_delta` the
/// signed change to reserved; `stock_before`/`stock_after` snapshot on-hand.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_transactions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub variant_id: Uuid,
    pub transaction_type: String,
    pub quantity_delta: i32,
    pub reserved_delta: i32,
    pub stock_before: i32,
    pub stock_after: i32,
    pub order_item_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub notes: String,
    pub reference_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn kind(&self) -> Option<TransactionType> {
        self.transaction_type.parse().ok()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::variant_stock::Entity",
        from = "Column::VariantId",
        to = "super::variant_stock::Column::VariantId"
    )]
    VariantStock,
}

impl Related<super::variant_stock::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::VariantStock.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}
