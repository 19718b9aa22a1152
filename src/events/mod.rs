use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::inventory_transaction::TransactionType;

pub mod outbox;

pub const AGGREGATE_VARIANT_STOCK: &str = "variant_stock";

/// Notifications raised by committed stock changes.
///
/// Delivery is at-least-once through the outbox, so handlers must tolerate
/// seeing the same event twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InventoryEvent {
    StockChanged {
        variant_id: Uuid,
        product_id: Uuid,
        /// Signed change to on-hand
        delta: i32,
        reserved_delta: i32,
        transaction_type: TransactionType,
        on_hand: i32,
        reserved: i32,
    },
    VariantFlagsChanged {
        variant_id: Uuid,
        product_id: Uuid,
        is_unlimited: bool,
        is_active: bool,
    },
}

impl InventoryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::StockChanged { .. } => "StockChanged",
            InventoryEvent::VariantFlagsChanged { .. } => "VariantFlagsChanged",
        }
    }

    pub fn variant_id(&self) -> Uuid {
        match self {
            InventoryEvent::StockChanged { variant_id, .. }
            | InventoryEvent::VariantFlagsChanged { variant_id, .. } => *variant_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<InventoryEvent>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<InventoryEvent>) -> Self {
        Self { sender }
    }

    /// Bounded channel plus the sender wrapping its transmit half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InventoryEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: InventoryEvent) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle_event(&self, event: &InventoryEvent) -> Result<(), String>;
}

/// Runs every handler on `event` concurrently. A failing handler does not
/// stop the others; the failures come back joined into one message.
pub async fn dispatch(handlers: &[Arc<dyn EventHandler>], event: &InventoryEvent) -> Result<(), String> {
    let results = join_all(handlers.iter().map(|h| h.handle_event(event))).await;
    let mut failures = Vec::new();
    for (handler, result) in handlers.iter().zip(results) {
        if let Err(e) = result {
            error!(
                handler = handler.name(),
                event_type = event.event_type(),
                variant_id = %event.variant_id(),
                "Event handler failed: {}",
                e
            );
            failures.push(format!("{}: {}", handler.name(), e));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

/// Receives events until every sender is dropped, fanning each one out to
/// all `handlers`. Failures are logged and the loop moves on.
pub async fn process_events(
    mut rx: mpsc::Receiver<InventoryEvent>,
    handlers: Vec<Arc<dyn EventHandler>>,
) {
    info!(handlers = handlers.len(), "Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(event_type = event.event_type(), variant_id = %event.variant_id(), "Received event");
        let _ = dispatch(&handlers, &event).await;
    }

    warn!("Event processing loop has ended");
}

/// Logs every event; useful as a default sink for the CLI worker.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle_event(&self, event: &InventoryEvent) -> Result<(), String> {
        if let InventoryEvent::StockChanged {
            variant_id,
            delta,
            transaction_type,
            on_hand,
            reserved,
            ..
        } = event
        {
            info!(
                %variant_id,
                delta,
                transaction_type = transaction_type.as_str(),
                on_hand,
                reserved,
                "stock changed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle_event(&self, _event: &InventoryEvent) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle_event(&self, _event: &InventoryEvent) -> Result<(), String> {
            Err("nope".into())
        }
    }

    fn sample() -> InventoryEvent {
        InventoryEvent::StockChanged {
            variant_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            delta: -2,
            reserved_delta: -2,
            transaction_type: TransactionType::Commit,
            on_hand: 8,
            reserved: 0,
        }
    }

    #[test]
    fn payload_is_tagged_json() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], "stock_changed");
        assert_eq!(json["transaction_type"], "commit");
    }

    #[tokio::test]
    async fn failing_handler_does_not_starve_the_others() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let (sender, rx) = EventSender::channel(8);
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(Failing), counting.clone()];
        let task = tokio::spawn(process_events(rx, handlers));

        sender.send(sample()).await.unwrap();
        sender.send(sample()).await.unwrap();
        drop(sender);
        task.await.unwrap();

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatch_joins_handler_failures() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let handlers: Vec<Arc<dyn EventHandler>> = vec![counting.clone(), Arc::new(Failing)];

        let err = dispatch(&handlers, &sample()).await.unwrap_err();
        assert_eq!(err, "failing: nope");
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        assert!(dispatch(&handlers[..1], &sample()).await.is_ok());
    }
}
