pub mod bulk_operations;
pub mod inventory;
pub mod inventory_queries;
pub mod reconciliation;
pub mod reservation_sweeper;
pub mod reservations;

pub use bulk_operations::{BulkAdjustItem, BulkOperationResult, BulkOperationService, BulkStockInItem};
pub use inventory::{InventoryService, MutationContext, StockChange};
pub use inventory_queries::{InventoryQueryService, InventoryStatus};
pub use reconciliation::{ReconciliationReport, ReconciliationService};
pub use reservation_sweeper::{OrderReleaser, ReservationSweeper, SweepResult};
pub use reservations::{OrderStockResult, ReservationCoordinator, ReservationOutcome, ReservationState};
