pub mod stock;

pub use stock::{StockLevel, StockMutation, StockTransition};
