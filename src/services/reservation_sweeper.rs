use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::InventorySettings;
use crate::errors::ServiceError;
use crate::repositories::OrderDirectory;
use crate::services::reservations::{OrderStockResult, ReservationCoordinator};

pub const EXPIRY_REASON: &str = "reservation expired: order unpaid";

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepResult {
    /// Expired unpaid orders still holding stock
    pub scanned: usize,
    /// Orders whose holds were handed back in this pass
    pub released: usize,
    /// Orders settled elsewhere between the scan and the release
    pub skipped: usize,
    /// Orders that failed and were left for the next pass
    pub failed: usize,
    pub swept_at: DateTime<Utc>,
}

/// Delay before retry number `attempt` (1-based): exponential plus up to one
/// base delay of jitter.
pub fn conflict_backoff(base: Duration, attempt: u32, jitter_fraction: f64) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp + base.mul_f64(jitter_fraction.clamp(0.0, 1.0))
}

/// Hands back whatever an order still holds.
#[async_trait]
pub trait OrderReleaser: Send + Sync {
    async fn release_order(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<OrderStockResult, ServiceError>;
}

#[async_trait]
impl OrderReleaser for ReservationCoordinator {
    async fn release_order(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<OrderStockResult, ServiceError> {
        self.release_stock_for_order(order_id, reason).await
    }
}

/// Releases reservations held by orders that stayed unpaid past the TTL.
#[derive(Clone)]
pub struct ReservationSweeper {
    releaser: Arc<dyn OrderReleaser>,
    orders: Arc<dyn OrderDirectory>,
    ttl: chrono::Duration,
    batch_size: u64,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl ReservationSweeper {
    pub fn new(
        releaser: Arc<dyn OrderReleaser>,
        orders: Arc<dyn OrderDirectory>,
        settings: &InventorySettings,
    ) -> Self {
        Self {
            releaser,
            orders,
            ttl: settings.reservation_ttl(),
            batch_size: settings.sweep_batch_size,
            retry_attempts: settings.conflict_retry_attempts,
            retry_base_delay: Duration::from_millis(settings.conflict_retry_base_delay_ms),
        }
    }

    /// One pass over unpaid orders created before `now - ttl` that still hold
    /// stock. Released orders drop out of the scan, so later passes reach the
    /// orders behind them. Each order is released on its own; one failure
    /// never aborts the batch.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepResult, ServiceError> {
        let cutoff = now - self.ttl;
        let expired = self
            .orders
            .expired_pending_orders(cutoff, self.batch_size)
            .await?;

        let mut result = SweepResult {
            scanned: expired.len(),
            swept_at: now,
            ..Default::default()
        };

        for order_id in expired {
            match self.release_with_retry(order_id).await {
                Ok(outcome) if outcome.applied > 0 => result.released += 1,
                Ok(_) => result.skipped += 1,
                Err(e) => {
                    error!(%order_id, code = e.code(), "failed to release expired order: {}", e);
                    result.failed += 1;
                }
            }
        }

        if result.scanned > 0 {
            info!(
                scanned = result.scanned,
                released = result.released,
                skipped = result.skipped,
                failed = result.failed,
                "expired reservation sweep finished"
            );
        }
        Ok(result)
    }

    async fn release_with_retry(&self, order_id: Uuid) -> Result<OrderStockResult, ServiceError> {
        let mut attempt = 0;
        loop {
            match self.releaser.release_order(order_id, EXPIRY_REASON).await {
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen::<f64>();
                    let delay = conflict_backoff(self.retry_base_delay, attempt, jitter);
                    warn!(%order_id, attempt, ?delay, "conflict releasing expired order, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Spawns a loop sweeping every `interval`. Abort the handle to stop it.
    pub fn start(self, interval: Duration) -> JoinHandle<()> {
        info!(?interval, "starting expired reservation sweeper");
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.sweep_once(Utc::now()).await {
                    error!("reservation sweep failed: {}", e);
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{order, order_item};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ExpiredOrders(Vec<Uuid>);

    #[async_trait]
    impl OrderDirectory for ExpiredOrders {
        async fn find_order(&self, _order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
            Ok(None)
        }

        async fn order_items(&self, _order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
            Ok(Vec::new())
        }

        async fn expired_pending_orders(
            &self,
            _cutoff: DateTime<Utc>,
            limit: u64,
        ) -> Result<Vec<Uuid>, ServiceError> {
            Ok(self.0.iter().copied().take(limit as usize).collect())
        }
    }

    enum Script {
        ConflictTimes(u32),
        AlwaysConflict,
        Missing,
    }

    struct ScriptedReleaser {
        script: Script,
        calls: AtomicU32,
    }

    impl ScriptedReleaser {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrderReleaser for ScriptedReleaser {
        async fn release_order(
            &self,
            order_id: Uuid,
            _reason: &str,
        ) -> Result<OrderStockResult, ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.script {
                Script::ConflictTimes(n) if call <= n => {
                    Err(ServiceError::ConcurrencyConflict(order_id))
                }
                Script::AlwaysConflict => Err(ServiceError::ConcurrencyConflict(order_id)),
                Script::Missing => Err(ServiceError::NotFound(format!("order {}", order_id))),
                Script::ConflictTimes(_) => Ok(OrderStockResult {
                    order_id,
                    items: Vec::new(),
                    applied: 1,
                }),
            }
        }
    }

    fn sweeper(releaser: Arc<ScriptedReleaser>, orders: Vec<Uuid>) -> ReservationSweeper {
        let settings = InventorySettings {
            conflict_retry_attempts: 3,
            conflict_retry_base_delay_ms: 1,
            ..Default::default()
        };
        ReservationSweeper::new(releaser, Arc::new(ExpiredOrders(orders)), &settings)
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_the_release_lands() {
        let releaser = ScriptedReleaser::new(Script::ConflictTimes(2));
        let result = sweeper(releaser.clone(), vec![Uuid::new_v4()])
            .sweep_once(Utc::now())
            .await
            .unwrap();

        assert_eq!((result.scanned, result.released, result.failed), (1, 1, 0));
        assert_eq!(releaser.calls(), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let releaser = ScriptedReleaser::new(Script::AlwaysConflict);
        let result = sweeper(releaser.clone(), vec![Uuid::new_v4(), Uuid::new_v4()])
            .sweep_once(Utc::now())
            .await
            .unwrap();

        assert_eq!((result.scanned, result.released, result.failed), (2, 0, 2));
        // One attempt plus three retries per order.
        assert_eq!(releaser.calls(), 8);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let releaser = ScriptedReleaser::new(Script::Missing);
        let result = sweeper(releaser.clone(), vec![Uuid::new_v4()])
            .sweep_once(Utc::now())
            .await
            .unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(releaser.calls(), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(50);
        assert_eq!(conflict_backoff(base, 1, 0.0), Duration::from_millis(50));
        assert_eq!(conflict_backoff(base, 2, 0.0), Duration::from_millis(100));
        assert_eq!(conflict_backoff(base, 4, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn jitter_is_bounded_by_one_base_delay() {
        let base = Duration::from_millis(50);
        assert_eq!(conflict_backoff(base, 1, 7.0), Duration::from_millis(100));
        assert!(conflict_backoff(base, 1, 0.5) < conflict_backoff(base, 2, 0.0) + base);
    }
}
