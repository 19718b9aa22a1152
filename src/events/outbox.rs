//! Transactional outbox.
//!
//! Mutations insert a row here on the same transaction as the counter and
//! ledger writes; [`OutboxWorker`] later claims pending rows, publishes them
//! and records the outcome. A crash between commit and publish leaves the row
//! pending, so nothing is lost.
//!
//! Where a row counts as delivered depends on how the worker publishes:
//! - [`OutboxWorker::with_handlers`] runs the handlers itself and marks the
//!   row delivered only after all of them succeeded. A failing handler
//!   reschedules the row, so every handler may see the event again.
//! - [`OutboxWorker::new`] marks the row delivered once the [`EventSender`]
//!   channel accepts the event. Events still queued in the channel are lost
//!   if the process dies before the consumer handles them.

use chrono::{DateTime, Utc};
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::OutboxSettings;
use crate::entities::outbox_event::{self, Column, Entity as OutboxEvent};
use crate::errors::ServiceError;
use crate::events::{dispatch, EventHandler, EventSender, InventoryEvent};
use crate::metrics;

/// Rows stuck in `processing` longer than this are assumed orphaned by a
/// crashed worker and handed back to `pending`.
const STALE_PROCESSING_SECS: i64 = 300;

const MAX_BACKOFF_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Enqueue a domain event into the outbox table. Call it with the open
/// transaction of the write it describes.
pub async fn enqueue<C: ConnectionTrait>(
    conn: &C,
    aggregate_type: &str,
    aggregate_id: Option<Uuid>,
    event: &InventoryEvent,
) -> Result<Uuid, ServiceError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    outbox_event::ActiveModel {
        id: Set(id),
        aggregate_type: Set(aggregate_type.to_string()),
        aggregate_id: Set(aggregate_id),
        event_type: Set(event.event_type().to_string()),
        payload: Set(serde_json::to_string(event)?),
        status: Set(OutboxStatus::Pending.as_str().to_string()),
        attempts: Set(0),
        available_at: Set(now),
        created_at: Set(now),
        updated_at: Set(None),
        processed_at: Set(None),
        error_message: Set(None),
    }
    .insert(conn)
    .await
    .map_err(ServiceError::db_error)?;

    debug!(
        outbox_id = %id,
        event_type = event.event_type(),
        aggregate_type,
        "enqueued outbox event"
    );
    Ok(id)
}

/// Delay before the next attempt: `base^attempts` seconds, capped at an
/// hour, plus jitter.
pub fn retry_delay(base_backoff_secs: u64, attempts: i32, jitter_ms: u64) -> chrono::Duration {
    let exp = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
    let secs = base_backoff_secs.saturating_pow(exp).min(MAX_BACKOFF_SECS);
    chrono::Duration::seconds(secs as i64)
        + chrono::Duration::milliseconds(jitter_ms.min(MAX_BACKOFF_SECS) as i64)
}

/// Outcome counts of one [`OutboxWorker::drain_once`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

#[derive(Clone)]
enum Publisher {
    Channel(EventSender),
    Handlers(Vec<Arc<dyn EventHandler>>),
}

impl Publisher {
    async fn publish(&self, event: InventoryEvent) -> Result<(), String> {
        match self {
            Publisher::Channel(sender) => sender.send(event).await,
            Publisher::Handlers(handlers) => dispatch(handlers, &event).await,
        }
    }
}

/// Background poller that publishes pending outbox rows.
#[derive(Clone)]
pub struct OutboxWorker {
    db: Arc<DatabaseConnection>,
    publisher: Publisher,
    settings: OutboxSettings,
}

impl OutboxWorker {
    /// Publishes into `sender`; a row is delivered once the channel takes it.
    pub fn new(db: Arc<DatabaseConnection>, sender: EventSender, settings: OutboxSettings) -> Self {
        Self {
            db,
            publisher: Publisher::Channel(sender),
            settings,
        }
    }

    /// Runs `handlers` on each row; a row is delivered once all of them succeed.
    pub fn with_handlers(
        db: Arc<DatabaseConnection>,
        handlers: Vec<Arc<dyn EventHandler>>,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            db,
            publisher: Publisher::Handlers(handlers),
            settings,
        }
    }

    /// Spawns the polling loop. Abort the handle to stop it.
    pub fn start(self) -> JoinHandle<()> {
        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            batch_size = self.settings.batch_size,
            "starting outbox worker"
        );
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.drain_once().await {
                    error!("outbox worker error: {}", e);
                }
                sleep(Duration::from_millis(self.settings.poll_interval_ms)).await;
            }
        })
    }

    /// Claims and dispatches one batch of due rows.
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainReport, ServiceError> {
        let now = Utc::now();
        self.requeue_stale(now).await?;

        let due = OutboxEvent::find()
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .filter(Column::AvailableAt.lte(now))
            .order_by_asc(Column::CreatedAt)
            .limit(self.settings.batch_size)
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;

        let mut report = DrainReport::default();
        for row in due {
            if !self.claim(&row).await? {
                continue;
            }
            report.claimed += 1;
            let attempts = row.attempts + 1;

            let event = match serde_json::from_str::<InventoryEvent>(&row.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(outbox_id = %row.id, "undecodable outbox payload: {}", e);
                    self.mark_failed(row.id, &format!("undecodable payload: {}", e))
                        .await?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.publisher.publish(event).await {
                Ok(()) => {
                    self.mark_delivered(row.id).await?;
                    metrics::OUTBOX_DISPATCHED.inc();
                    report.delivered += 1;
                }
                Err(e) if attempts < self.settings.max_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..1000);
                    let next = Utc::now()
                        + retry_delay(self.settings.base_backoff_secs, attempts, jitter);
                    warn!(outbox_id = %row.id, attempts, "outbox dispatch failed, retrying: {}", e);
                    self.reschedule(row.id, next, &e).await?;
                    report.retried += 1;
                }
                Err(e) => {
                    error!(outbox_id = %row.id, attempts, "outbox dispatch failed permanently: {}", e);
                    self.mark_failed(row.id, &format!("max attempts exceeded: {}", e))
                        .await?;
                    report.failed += 1;
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed,
                "outbox batch drained"
            );
        }
        Ok(report)
    }

    /// Conditional `pending -> processing` flip; false when another worker won.
    async fn claim(&self, row: &outbox_event::Model) -> Result<bool, ServiceError> {
        let result = OutboxEvent::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Processing.as_str()))
            .col_expr(Column::Attempts, Expr::value(row.attempts + 1))
            .col_expr(Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(Column::Id.eq(row.id))
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .filter(Column::Attempts.eq(row.attempts))
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        Ok(result.rows_affected == 1)
    }

    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let cutoff = now - chrono::Duration::seconds(STALE_PROCESSING_SECS);
        let result = OutboxEvent::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Pending.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(Some(now)))
            .filter(Column::Status.eq(OutboxStatus::Processing.as_str()))
            .filter(Column::UpdatedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected > 0 {
            warn!(rows = result.rows_affected, "requeued stale outbox rows");
        }
        Ok(())
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        OutboxEvent::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Delivered.as_str()))
            .col_expr(Column::ProcessedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(Column::ErrorMessage, Expr::value(Option::<String>::None))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), ServiceError> {
        OutboxEvent::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Pending.as_str()))
            .col_expr(Column::AvailableAt, Expr::value(available_at))
            .col_expr(Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(Column::ErrorMessage, Expr::value(Some(error.to_string())))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), ServiceError> {
        OutboxEvent::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Failed.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(Column::ErrorMessage, Expr::value(Some(error.to_string())))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        assert_eq!(retry_delay(2, 1, 0), chrono::Duration::seconds(2));
        assert_eq!(retry_delay(2, 3, 0), chrono::Duration::seconds(8));
        assert_eq!(
            retry_delay(2, 3, 250),
            chrono::Duration::seconds(8) + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(retry_delay(u64::MAX, 40, 0), chrono::Duration::hours(1));
    }
}
