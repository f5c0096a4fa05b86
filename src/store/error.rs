use thiserror::Error;

/// Postgres SQLSTATE raised by `FOR UPDATE NOWAIT` on a locked row
pub const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

/// Postgres SQLSTATE for unique constraint violations
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another transaction holds the row lock (NOWAIT) or the wait timed out
    #[error("Row lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Corrupt row: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        StoreError::NotFound { entity, id }
    }

    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, StoreError::LockUnavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let code = e
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());
        match code.as_deref() {
            Some(SQLSTATE_LOCK_NOT_AVAILABLE) => StoreError::LockUnavailable(e.to_string()),
            Some(SQLSTATE_UNIQUE_VIOLATION) => StoreError::Conflict(e.to_string()),
            _ => StoreError::Database(e),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_is_database_error() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(_)));
        assert!(!err.is_lock_unavailable());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StoreError::not_found("transaction", 42).to_string(),
            "transaction 42 not found"
        );
        assert!(StoreError::LockUnavailable("users:1".into()).is_lock_unavailable());
    }
}
