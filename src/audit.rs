//! Human-readable audit narrative, separate from the ledger.
//!
//! Records are emitted only after the unit of work has committed, so a
//! rolled-back mutation never shows up here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub action: String,
    pub variant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub quantity_delta: i32,
    pub reserved_delta: i32,
    pub stock_before: i32,
    pub stock_after: i32,
    pub ledger_entry_id: Option<i64>,
    pub notes: String,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Writes each record as a structured event on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn record(&self, record: AuditRecord) {
        info!(
            target: "audit",
            action = %record.action,
            variant_id = %record.variant_id,
            user_id = ?record.user_id,
            quantity_delta = record.quantity_delta,
            reserved_delta = record.reserved_delta,
            stock_before = record.stock_before,
            stock_after = record.stock_after,
            ledger_entry_id = ?record.ledger_entry_id,
            recorded_at = %record.recorded_at,
            "{}",
            record.notes
        );
    }
}

/// Keeps records in memory; handy for asserting on the narrative in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLogger {
    records: std::sync::Arc<tokio::sync::Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditLogger for MemoryAuditLogger {
    async fn record(&self, record: AuditRecord) {
        self.records.lock().await.push(record);
    }
}
