use sea_orm::error::DbErr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Concurrent modification of variant {0}")]
    ConcurrencyConflict(Uuid),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Stable machine-readable code, used in bulk item results and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::EventError(_) => "event_error",
            Self::CacheError(_) => "cache_error",
            Self::LockUnavailable(_) => "lock_unavailable",
            Self::ConfigError(_) => "config_error",
            Self::SerializationError(_) => "serialization_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Only a lost optimistic-concurrency race is worth retrying; everything
    /// else is either a business rejection or an infrastructure fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrency_conflicts_are_retryable() {
        assert!(ServiceError::ConcurrencyConflict(Uuid::nil()).is_retryable());
        assert!(!ServiceError::InsufficientStock("x".into()).is_retryable());
        assert!(!ServiceError::NotFound("x".into()).is_retryable());
        assert!(!ServiceError::ValidationError("x".into()).is_retryable());
        assert!(!ServiceError::db_error("boom").is_retryable());
    }

    #[test]
    fn codes_are_snake_case_and_distinct() {
        let errors = [
            ServiceError::NotFound("x".into()),
            ServiceError::ValidationError("x".into()),
            ServiceError::InsufficientStock("x".into()),
            ServiceError::ConcurrencyConflict(Uuid::nil()),
            ServiceError::InvalidOperation("x".into()),
            ServiceError::db_error("x"),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| c.chars().all(|ch| ch.is_ascii_lowercase() || ch == '_')));
    }

    #[test]
    fn display_includes_message() {
        assert_eq!(
            ServiceError::NotFound("variant 7".into()).to_string(),
            "Not found: variant 7"
        );
        let id = Uuid::new_v4();
        assert!(ServiceError::ConcurrencyConflict(id)
            .to_string()
            .contains(&id.to_string()));
    }
}
