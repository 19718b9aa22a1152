//! Reservation coordinator.
//!
//! The reservation state of an order item is not stored anywhere; it is read
//! back from the ledger entries that carry the item's id. Every operation
//! loads the variant row before inspecting those entries, so a concurrent
//! settlement either shows up in the entries or turns the final conditional
//! write into a `ConcurrencyConflict`.

use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::db::transaction::{begin, finish_unit_of_work};
use crate::entities::inventory_transaction::{self, TransactionType};
use crate::entities::order_item;
use crate::errors::ServiceError;
use crate::metrics;
use crate::models::StockMutation;
use crate::repositories::order_repository::RETURNABLE_STATUSES;
use crate::repositories::{InventoryTransactionRepository, OrderDirectory, VariantStockRepository};
use crate::services::inventory::{apply_loaded, publish_committed, require_notes, AppliedMutation, MutationContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Unreserved,
    Reserved,
    Committed,
    Released,
    Returned,
}

/// Where an order item stands after an operation. Repeating a settled
/// operation yields an identical value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub order_item_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub state: ReservationState,
    /// Ledger entry that put the item in `state`
    pub ledger_entry_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStockResult {
    pub order_id: Uuid,
    pub items: Vec<ReservationOutcome>,
    /// Items that produced a new ledger entry in this call
    pub applied: usize,
}

/// Reservation history of one order item, folded from its ledger entries.
#[derive(Debug, Clone, Default)]
struct ItemHistory {
    reservation: Option<inventory_transaction::Model>,
    settlement: Option<inventory_transaction::Model>,
    returned: Option<inventory_transaction::Model>,
}

impl ItemHistory {
    fn from_entries(entries: Vec<inventory_transaction::Model>) -> Self {
        let mut history = Self::default();
        for entry in entries {
            match entry.kind() {
                Some(TransactionType::Reservation) if history.reservation.is_none() => {
                    history.reservation = Some(entry)
                }
                Some(kind) if kind.is_terminal() => {
                    if history.settlement.is_none() {
                        history.settlement = Some(entry);
                    }
                }
                Some(TransactionType::Return) => history.returned = Some(entry),
                _ => {}
            }
        }
        history
    }

    fn reserved_quantity(&self) -> i32 {
        self.reservation.as_ref().map_or(0, |e| e.reserved_delta)
    }

    fn outcome(&self, order_item_id: Uuid, variant_id: Uuid, quantity: i32) -> ReservationOutcome {
        let (state, entry) = if let Some(ret) = &self.returned {
            (ReservationState::Returned, Some(ret))
        } else if let Some(settled) = &self.settlement {
            let state = match settled.kind() {
                Some(TransactionType::Commit) => ReservationState::Committed,
                _ => ReservationState::Released,
            };
            (state, Some(settled))
        } else if let Some(held) = &self.reservation {
            (ReservationState::Reserved, Some(held))
        } else {
            (ReservationState::Unreserved, None)
        };
        ReservationOutcome {
            order_item_id,
            variant_id: entry.map_or(variant_id, |e| e.variant_id),
            quantity: entry.map_or(quantity, |e| match e.kind() {
                Some(TransactionType::Return) => e.quantity_delta,
                _ => e.reserved_delta.abs(),
            }),
            state,
            ledger_entry_id: entry.map(|e| e.id),
        }
    }
}

fn outcome_from_applied(order_item_id: Uuid, state: ReservationState, applied: &AppliedMutation) -> ReservationOutcome {
    let change = &applied.change;
    ReservationOutcome {
        order_item_id,
        variant_id: change.variant_id,
        quantity: if state == ReservationState::Returned {
            change.quantity_delta
        } else {
            change.reserved_delta.abs()
        },
        state,
        ledger_entry_id: Some(change.ledger_entry_id),
    }
}

/// Loads the item's history and checks that its hold, if any, sits on
/// `variant_id`. Call it after loading the variant row.
async fn load_history<C: ConnectionTrait>(
    conn: &C,
    order_item_id: Uuid,
    variant_id: Uuid,
) -> Result<ItemHistory, ServiceError> {
    let entries = InventoryTransactionRepository::find_for_order_item(conn, order_item_id).await?;
    let history = ItemHistory::from_entries(entries);
    match &history.reservation {
        Some(held) if held.variant_id != variant_id => Err(ServiceError::InvalidOperation(format!(
            "order item {} holds stock of variant {}, not {}",
            order_item_id, held.variant_id, variant_id
        ))),
        _ => Ok(history),
    }
}

/// Reserve for one order item, on an open unit of work.
async fn reserve_item_in<C: ConnectionTrait>(
    conn: &C,
    order_item_id: Uuid,
    variant_id: Uuid,
    quantity: i32,
) -> Result<(ReservationOutcome, Option<AppliedMutation>), ServiceError> {
    let mutation = StockMutation::Reserve(quantity);
    mutation.validate()?;
    let current = VariantStockRepository::find(conn, variant_id).await?;
    let history = load_history(conn, order_item_id, variant_id).await?;

    if let Some(settled) = &history.settlement {
        return Err(ServiceError::InvalidOperation(format!(
            "order item {} was already settled ({})",
            order_item_id, settled.transaction_type
        )));
    }
    if history.reservation.is_some() {
        debug!(%order_item_id, "reservation already held");
        return Ok((history.outcome(order_item_id, variant_id, quantity), None));
    }

    let applied = apply_loaded(
        conn,
        &current,
        mutation,
        &MutationContext::for_order_item(order_item_id, "reserved for order item"),
    )
    .await?;
    Ok((
        outcome_from_applied(order_item_id, ReservationState::Reserved, &applied),
        Some(applied),
    ))
}

async fn commit_item_in<C: ConnectionTrait>(
    conn: &C,
    order_item_id: Uuid,
    variant_id: Uuid,
) -> Result<(ReservationOutcome, Option<AppliedMutation>), ServiceError> {
    let current = VariantStockRepository::find(conn, variant_id).await?;
    let history = load_history(conn, order_item_id, variant_id).await?;

    match history.settlement.as_ref().and_then(|e| e.kind()) {
        Some(TransactionType::Commit) => {
            debug!(%order_item_id, "commit already recorded");
            return Ok((history.outcome(order_item_id, variant_id, 0), None));
        }
        Some(_) => {
            return Err(ServiceError::InvalidOperation(format!(
                "order item {} reservation was released and cannot be committed",
                order_item_id
            )));
        }
        None => {}
    }
    if history.reservation.is_none() {
        return Err(ServiceError::InvalidOperation(format!(
            "order item {} has no reservation to commit",
            order_item_id
        )));
    }

    let applied = apply_loaded(
        conn,
        &current,
        StockMutation::Commit(history.reserved_quantity()),
        &MutationContext::for_order_item(order_item_id, "reservation committed on payment"),
    )
    .await?;
    Ok((
        outcome_from_applied(order_item_id, ReservationState::Committed, &applied),
        Some(applied),
    ))
}

async fn release_item_in<C: ConnectionTrait>(
    conn: &C,
    order_item_id: Uuid,
    variant_id: Uuid,
    reason: &str,
) -> Result<(ReservationOutcome, Option<AppliedMutation>), ServiceError> {
    let current = VariantStockRepository::find(conn, variant_id).await?;
    let history = load_history(conn, order_item_id, variant_id).await?;

    // Settled or never reserved: nothing to hand back.
    if history.settlement.is_some() || history.reservation.is_none() {
        debug!(%order_item_id, "nothing to release");
        return Ok((history.outcome(order_item_id, variant_id, 0), None));
    }

    let applied = apply_loaded(
        conn,
        &current,
        StockMutation::Release(history.reserved_quantity()),
        &MutationContext::for_order_item(order_item_id, reason),
    )
    .await?;
    Ok((
        outcome_from_applied(order_item_id, ReservationState::Released, &applied),
        Some(applied),
    ))
}

async fn return_item_in<C: ConnectionTrait>(
    conn: &C,
    item: &order_item::Model,
    user_id: Option<Uuid>,
    reason: &str,
) -> Result<(ReservationOutcome, Option<AppliedMutation>), ServiceError> {
    let current = VariantStockRepository::find(conn, item.variant_id).await?;
    let history = load_history(conn, item.id, item.variant_id).await?;

    if history.returned.is_some() {
        debug!(order_item_id = %item.id, "return already recorded");
        return Ok((history.outcome(item.id, item.variant_id, item.quantity), None));
    }
    let committed = history
        .settlement
        .as_ref()
        .and_then(|e| e.kind())
        .map_or(false, |k| k == TransactionType::Commit);
    if !committed {
        return Err(ServiceError::InvalidOperation(format!(
            "order item {} was never committed and cannot be returned",
            item.id
        )));
    }

    let ctx = MutationContext {
        user_id,
        order_item_id: Some(item.id),
        notes: reason.to_string(),
        reference_number: None,
    };
    let applied = apply_loaded(conn, &current, StockMutation::Return(item.quantity), &ctx).await?;
    Ok((
        outcome_from_applied(item.id, ReservationState::Returned, &applied),
        Some(applied),
    ))
}

/// Sequences reserve, commit, release and return against an order's lifecycle.
#[derive(Clone)]
pub struct ReservationCoordinator {
    db: Arc<DatabaseConnection>,
    orders: Arc<dyn OrderDirectory>,
    audit: Arc<dyn AuditLogger>,
}

impl ReservationCoordinator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: Arc<dyn OrderDirectory>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self { db, orders, audit }
    }

    /// Holds `quantity` units of `variant_id` for an order item. Repeating the
    /// call while the hold exists is a no-op.
    #[instrument(skip(self))]
    pub async fn reserve_item(
        &self,
        order_item_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<ReservationOutcome, ServiceError> {
        StockMutation::Reserve(quantity).validate()?;
        let txn = begin(&self.db).await?;
        let result = reserve_item_in(&txn, order_item_id, variant_id, quantity).await;
        self.settle_single("reserve", finish_unit_of_work(txn, result).await).await
    }

    /// Converts the item's hold into a permanent decrement.
    #[instrument(skip(self))]
    pub async fn commit_item(
        &self,
        order_item_id: Uuid,
        variant_id: Uuid,
    ) -> Result<ReservationOutcome, ServiceError> {
        let txn = begin(&self.db).await?;
        let result = commit_item_in(&txn, order_item_id, variant_id).await;
        self.settle_single("commit", finish_unit_of_work(txn, result).await).await
    }

    /// Hands the item's hold back to available stock.
    #[instrument(skip(self))]
    pub async fn release_item(
        &self,
        order_item_id: Uuid,
        variant_id: Uuid,
        reason: &str,
    ) -> Result<ReservationOutcome, ServiceError> {
        let txn = begin(&self.db).await?;
        let result = release_item_in(&txn, order_item_id, variant_id, reason).await;
        self.settle_single("release", finish_unit_of_work(txn, result).await).await
    }

    async fn settle_single(
        &self,
        operation: &str,
        result: Result<(ReservationOutcome, Option<AppliedMutation>), ServiceError>,
    ) -> Result<ReservationOutcome, ServiceError> {
        match result {
            Ok((outcome, applied)) => {
                publish_committed(self.audit.as_ref(), applied.into_iter().collect()).await;
                Ok(outcome)
            }
            Err(e) => {
                metrics::record_failure(&e);
                warn!(operation, code = e.code(), "reservation operation failed: {}", e);
                Err(e)
            }
        }
    }

    /// Reserves every item of the order in a single unit of work: either all
    /// items are held or none are.
    #[instrument(skip(self))]
    pub async fn reserve_stock_for_order(&self, order_id: Uuid) -> Result<OrderStockResult, ServiceError> {
        let items = self.load_items(order_id).await?;
        for item in &items {
            StockMutation::Reserve(item.quantity).validate()?;
        }

        let txn = begin(&self.db).await?;
        let result: Result<Vec<_>, ServiceError> = async {
            let mut settled = Vec::with_capacity(items.len());
            for item in &items {
                settled.push(reserve_item_in(&txn, item.id, item.variant_id, item.quantity).await?);
            }
            Ok(settled)
        }
        .await;
        self.settle_order("reserve", order_id, finish_unit_of_work(txn, result).await)
            .await
    }

    /// Commits the held stock of every item; already committed items are skipped.
    #[instrument(skip(self))]
    pub async fn commit_stock_for_order(&self, order_id: Uuid) -> Result<OrderStockResult, ServiceError> {
        let items = self.load_items(order_id).await?;

        let txn = begin(&self.db).await?;
        let result: Result<Vec<_>, ServiceError> = async {
            let mut settled = Vec::with_capacity(items.len());
            for item in &items {
                settled.push(commit_item_in(&txn, item.id, item.variant_id).await?);
            }
            Ok(settled)
        }
        .await;
        self.settle_order("commit", order_id, finish_unit_of_work(txn, result).await)
            .await
    }

    /// Releases whatever the order still holds. Used by cancellation and by
    /// the expiry sweep, which may race each other; the loser is a no-op.
    #[instrument(skip(self))]
    pub async fn release_stock_for_order(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<OrderStockResult, ServiceError> {
        let items = self.load_items(order_id).await?;

        let txn = begin(&self.db).await?;
        let result: Result<Vec<_>, ServiceError> = async {
            let mut settled = Vec::with_capacity(items.len());
            for item in &items {
                settled.push(release_item_in(&txn, item.id, item.variant_id, reason).await?);
            }
            Ok(settled)
        }
        .await;
        self.settle_order("release", order_id, finish_unit_of_work(txn, result).await)
            .await
    }

    /// Puts the sold units of a delivered or completed order back on hand.
    #[instrument(skip(self, reason))]
    pub async fn return_stock_for_order(
        &self,
        order_id: Uuid,
        user_id: Option<Uuid>,
        reason: &str,
    ) -> Result<OrderStockResult, ServiceError> {
        require_notes(reason, "order return")?;
        let order = self
            .orders
            .find_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
        if !RETURNABLE_STATUSES.contains(&order.status.as_str()) {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is {} and cannot be returned",
                order_id, order.status
            )));
        }
        let items = self.orders.order_items(order_id).await?;

        let txn = begin(&self.db).await?;
        let result: Result<Vec<_>, ServiceError> = async {
            let mut settled = Vec::with_capacity(items.len());
            for item in &items {
                settled.push(return_item_in(&txn, item, user_id, reason).await?);
            }
            Ok(settled)
        }
        .await;
        self.settle_order("return", order_id, finish_unit_of_work(txn, result).await)
            .await
    }

    async fn load_items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        if self.orders.find_order(order_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!("order {}", order_id)));
        }
        self.orders.order_items(order_id).await
    }

    async fn settle_order(
        &self,
        operation: &str,
        order_id: Uuid,
        result: Result<Vec<(ReservationOutcome, Option<AppliedMutation>)>, ServiceError>,
    ) -> Result<OrderStockResult, ServiceError> {
        let settled = match result {
            Ok(settled) => settled,
            Err(e) => {
                metrics::record_failure(&e);
                warn!(operation, %order_id, code = e.code(), "order stock operation failed: {}", e);
                return Err(e);
            }
        };

        let mut items = Vec::with_capacity(settled.len());
        let mut applied = Vec::new();
        for (outcome, mutation) in settled {
            items.push(outcome);
            applied.extend(mutation);
        }
        let applied_count = applied.len();
        publish_committed(self.audit.as_ref(), applied).await;

        info!(operation, %order_id, items = items.len(), applied = applied_count, "order stock operation committed");
        Ok(OrderStockResult {
            order_id,
            items,
            applied: applied_count,
        })
    }
}
