pub mod inventory_transaction;
pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod variant_stock;
