pub mod inventory_transaction_repository;
pub mod order_repository;
pub mod variant_stock_repository;

pub use inventory_transaction_repository::{
    InventoryTransactionRepository, NewLedgerEntry, TransactionFilter, TransactionPage,
};
pub use order_repository::{OrderDirectory, OrderRepository};
pub use variant_stock_repository::VariantStockRepository;
