/*!
 * Unit-of-work helpers
 *
 * Every stock mutation runs inside one `DatabaseTransaction`: the counter
 * update, its ledger row and its outbox row either all land or none do.
 */

use crate::errors::ServiceError;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use tracing::warn;

/// Opens a new unit of work.
pub async fn begin(db: &DatabaseConnection) -> Result<DatabaseTransaction, ServiceError> {
    db.begin().await.map_err(ServiceError::DatabaseError)
}

/// Commits `txn` when `result` is `Ok`, rolls it back otherwise.
///
/// A failed rollback is logged and the original error is returned; the
/// driver discards the transaction when the connection goes back to the pool.
pub async fn finish_unit_of_work<T>(
    txn: DatabaseTransaction,
    result: Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    match result {
        Ok(value) => {
            txn.commit().await.map_err(ServiceError::DatabaseError)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                warn!(error = %rollback_err, "rollback failed after {}", err);
            }
            Err(err)
        }
    }
}
