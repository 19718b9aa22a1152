mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::TestEngine;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use stock_ledger::entities::inventory_transaction::TransactionType;
use stock_ledger::entities::outbox_event;
use stock_ledger::errors::ServiceError;
use stock_ledger::events::{EventHandler, EventSender, InventoryEvent};
use stock_ledger::repositories::TransactionFilter;
use uuid::Uuid;

async fn outbox_rows(t: &TestEngine) -> Vec<outbox_event::Model> {
    outbox_event::Entity::find()
        .all(t.engine.db.as_ref())
        .await
        .expect("load outbox")
}

#[tokio::test]
async fn drain_delivers_committed_changes_once() {
    let t = TestEngine::new().await;
    let variant_id = t.variant(10).await;
    t.engine.inventory.reserve(variant_id, 3).await.unwrap();
    // Rejected mutations never reach the outbox.
    let _ = t.engine.inventory.remove_stock(variant_id, 50, None, "oops").await;

    let (sender, mut rx) = EventSender::channel(16);
    let worker = t.engine.outbox_worker(sender);

    let report = worker.drain_once().await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.delivered, 2);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 2);
    assert_matches!(
        &events[1],
        InventoryEvent::StockChanged {
            transaction_type: TransactionType::Reservation,
            reserved: 3,
            on_hand: 10,
            ..
        }
    );
    assert!(events.iter().all(|e| e.variant_id() == variant_id));

    let again = worker.drain_once().await.unwrap();
    assert_eq!(again.claimed, 0);
    assert!(rx.try_recv().is_err());

    let rows = outbox_rows(&t).await;
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row.status, "delivered");
        assert_eq!(row.attempts, 1);
        assert!(row.processed_at.is_some());
    }
}

#[tokio::test]
async fn failed_dispatch_is_rescheduled_with_backoff() {
    let t = TestEngine::new().await;
    t.variant(1).await;

    let (sender, rx) = EventSender::channel(4);
    drop(rx);
    let worker = t.engine.outbox_worker(sender);

    let report = worker.drain_once().await.unwrap();
    assert_eq!((report.claimed, report.retried), (1, 1));

    let rows = outbox_rows(&t).await;
    assert_eq!(rows[0].status, "pending");
    assert_eq!(rows[0].attempts, 1);
    assert!(rows[0].available_at > Utc::now());
    assert!(rows[0].error_message.is_some());

    // Not due yet.
    let next = worker.drain_once().await.unwrap();
    assert_eq!(next.claimed, 0);
}

#[tokio::test]
async fn dispatch_gives_up_after_max_attempts() {
    let mut cfg = stock_ledger::config::AppConfig::for_database("sqlite::memory:");
    cfg.outbox.max_attempts = 1;
    let t = TestEngine::with_config(cfg).await;
    t.variant(1).await;

    let (sender, rx) = EventSender::channel(4);
    drop(rx);
    let report = t.engine.outbox_worker(sender).drain_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let rows = outbox_rows(&t).await;
    assert_eq!(rows[0].status, "failed");
}

#[tokio::test]
async fn undecodable_payload_fails_immediately() {
    let t = TestEngine::new().await;
    let now = Utc::now();
    outbox_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        aggregate_type: Set("variant_stock".into()),
        aggregate_id: Set(None),
        event_type: Set("StockChanged".into()),
        payload: Set("{not json".into()),
        status: Set("pending".into()),
        attempts: Set(0),
        available_at: Set(now),
        created_at: Set(now),
        updated_at: Set(None),
        processed_at: Set(None),
        error_message: Set(None),
    }
    .insert(t.engine.db.as_ref())
    .await
    .unwrap();

    let (sender, _rx) = EventSender::channel(4);
    let report = t.engine.outbox_worker(sender).drain_once().await.unwrap();
    assert_eq!((report.claimed, report.failed, report.delivered), (1, 1, 0));
    assert_eq!(outbox_rows(&t).await[0].status, "failed");
}

#[tokio::test]
async fn delivered_events_invalidate_cached_status() {
    let t = TestEngine::new().await;
    let variant_id = t.variant(10).await;

    let cached = t.engine.queries.get_inventory_status(variant_id).await.unwrap();
    assert_eq!(cached.on_hand, 10);

    t.engine
        .inventory
        .add_stock(variant_id, 5, None, "restock")
        .await
        .unwrap();
    // Served from cache until the change event arrives.
    let stale = t.engine.queries.get_inventory_status(variant_id).await.unwrap();
    assert_eq!(stale.on_hand, 10);

    let (sender, mut rx) = EventSender::channel(16);
    t.engine.outbox_worker(sender).drain_once().await.unwrap();
    let handler = t.engine.cache_invalidation_handler();
    while let Ok(event) = rx.try_recv() {
        handler.handle_event(&event).await.unwrap();
    }

    let fresh = t.engine.queries.get_inventory_status(variant_id).await.unwrap();
    assert_eq!(fresh.on_hand, 15);
}

/// Fails its first `failures` events, then succeeds.
struct FlakyHandler {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for FlakyHandler {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn handle_event(&self, _event: &InventoryEvent) -> Result<(), String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err("search index unavailable".into())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn rows_are_acknowledged_only_after_handlers_succeed() {
    let t = TestEngine::new().await;
    let variant_id = t.variant(10).await;
    // Settle the initial receipt so only the restock below is pending.
    t.engine
        .outbox_worker_with_handlers(Vec::new())
        .drain_once()
        .await
        .unwrap();
    let cached = t.engine.queries.get_inventory_status(variant_id).await.unwrap();
    assert_eq!(cached.on_hand, 10);
    t.engine
        .inventory
        .add_stock(variant_id, 5, None, "restock")
        .await
        .unwrap();

    let flaky = Arc::new(FlakyHandler {
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    let mut handlers = t.engine.event_handlers();
    handlers.push(flaky.clone());
    let worker = t.engine.outbox_worker_with_handlers(handlers);

    let first = worker.drain_once().await.unwrap();
    assert_eq!((first.claimed, first.delivered, first.retried), (1, 0, 1));
    let row = outbox_rows(&t)
        .await
        .into_iter()
        .find(|r| r.status != "delivered")
        .expect("rescheduled row");
    assert_eq!(row.status, "pending");
    assert!(row.error_message.as_deref().unwrap_or_default().contains("flaky"));

    // Make the row due again.
    outbox_event::Entity::update_many()
        .col_expr(
            outbox_event::Column::AvailableAt,
            Expr::value(Utc::now() - Duration::seconds(1)),
        )
        .filter(outbox_event::Column::Id.eq(row.id))
        .exec(t.engine.db.as_ref())
        .await
        .unwrap();

    let second = worker.drain_once().await.unwrap();
    assert_eq!((second.claimed, second.delivered), (1, 1));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert!(outbox_rows(&t).await.iter().all(|r| r.status == "delivered"));

    let fresh = t.engine.queries.get_inventory_status(variant_id).await.unwrap();
    assert_eq!(fresh.on_hand, 15);
}

#[tokio::test]
async fn low_stock_report_lists_limited_active_variants() {
    let t = TestEngine::new().await;
    let low = t.variant(2).await;
    let plenty = t.variant(50).await;
    let mostly_held = t.variant(20).await;
    t.engine.inventory.reserve(mostly_held, 19).await.unwrap();
    let inactive = t.variant(1).await;
    t.engine.inventory.set_active(inactive, false).await.unwrap();
    t.variant_with(0, true).await;

    let report = t.engine.queries.get_low_stock_products(Some(5)).await.unwrap();
    let ids: Vec<_> = report.iter().map(|s| s.variant_id).collect();
    assert_eq!(ids, vec![mostly_held, low]);
    assert!(report.iter().all(|s| s.is_low_stock));
    assert!(!ids.contains(&plenty));

    let default_threshold = t.engine.queries.get_low_stock_products(None).await.unwrap();
    assert_eq!(default_threshold.len(), 2);
}

#[tokio::test]
async fn transaction_history_pages_newest_first() {
    let t = TestEngine::new().await;
    let variant_id = t.variant(10).await;
    let other = t.variant(3).await;
    for i in 1..=6 {
        t.engine
            .inventory
            .add_stock(variant_id, i, None, "restock")
            .await
            .unwrap();
    }

    let first = t
        .engine
        .queries
        .get_transactions(&TransactionFilter {
            per_page: 3,
            ..TransactionFilter::for_variant(variant_id)
        })
        .await
        .unwrap();
    assert_eq!(first.total, 7);
    assert_eq!(first.items.len(), 3);
    assert_eq!(first.items[0].quantity_delta, 6);
    assert!(first.items.windows(2).all(|w| w[0].id > w[1].id));

    let last = t
        .engine
        .queries
        .get_transactions(&TransactionFilter {
            page: 3,
            per_page: 3,
            ..TransactionFilter::for_variant(variant_id)
        })
        .await
        .unwrap();
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.items[0].notes, "initial receipt");

    let stock_ins = t
        .engine
        .queries
        .get_transactions(&TransactionFilter {
            transaction_type: Some(TransactionType::StockIn),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stock_ins.total, 8);
    assert!(stock_ins.items.iter().any(|e| e.variant_id == other));

    assert_matches!(
        t.engine
            .queries
            .get_transactions(&TransactionFilter {
                per_page: 0,
                ..Default::default()
            })
            .await,
        Err(ServiceError::ValidationError(_))
    );
}
