use async_trait::async_trait;
use std::error::Error as StdError;

/// Boxed error returned by a unit of work.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error type for transaction-aware operations
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Invalid lock target: {0}")]
    InvalidTarget(String),

    #[error("Lock acquisition failed: {0}")]
    LockAcquisitionFailed(#[source] sqlx::Error),

    #[error("Unit of work failed: {0}")]
    UnitOfWorkFailed(#[source] BoxError),

    #[error("Transaction commit failed: {0}")]
    CommitFailed(#[source] sqlx::Error),

    #[error("Transaction rollback failed: {0}")]
    RollbackFailed(#[source] sqlx::Error),

    /// The transaction was committed, but an observer's `on_commit` failed.
    #[error("Observer failed after commit: {0}")]
    ObserverFailed(#[source] Box<TransactionError>),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// SQLSTATE raised by Postgres when it breaks a deadlock.
const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for `NOWAIT` and `lock_timeout` failures.
const LOCK_NOT_AVAILABLE: &str = "55P03";

impl TransactionError {
    /// Returns true when the database refused a row lock (deadlock or lock wait failure).
    pub fn is_lock_conflict(&self) -> bool {
        let source = match self {
            TransactionError::LockAcquisitionFailed(e)
            | TransactionError::CommitFailed(e)
            | TransactionError::DatabaseError(e) => e,
            _ => return false,
        };
        match source {
            sqlx::Error::Database(db) => matches!(
                db.code().as_deref(),
                Some(DEADLOCK_DETECTED) | Some(LOCK_NOT_AVAILABLE)
            ),
            _ => false,
        }
    }

    /// Recovers the unit of work's own error, if that is what failed.
    pub fn downcast_work<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            TransactionError::UnitOfWorkFailed(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result type for transaction-aware operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Trait for components that need to be notified of transaction lifecycle events.
///
/// Components implementing this trait can be registered with a UnitOfWorkSession
/// (or handed to a `SafelyTransaction` through `observe`) to receive callbacks
/// when the transaction is committed or rolled back.
#[async_trait]
pub trait TransactionAware: Send + Sync {
    /// Called after a successful transaction commit.
    async fn on_commit(&self) -> TransactionResult<()>;

    /// Called after a transaction rollback.
    ///
    /// Implementations should use this to revert any in-memory state changes
    /// that were made during the transaction.
    async fn on_rollback(&self) -> TransactionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("insufficient funds")]
    struct InsufficientFunds;

    #[test]
    fn downcast_recovers_work_error() {
        let err = TransactionError::UnitOfWorkFailed(Box::new(InsufficientFunds));
        assert!(err.downcast_work::<InsufficientFunds>().is_some());
        assert!(err.downcast_work::<std::io::Error>().is_none());
    }

    #[test]
    fn downcast_ignores_other_variants() {
        let err = TransactionError::InvalidTarget("empty table".into());
        assert!(err.downcast_work::<InsufficientFunds>().is_none());
    }

    #[test]
    fn non_database_errors_are_not_lock_conflicts() {
        let not_found = TransactionError::LockAcquisitionFailed(sqlx::Error::RowNotFound);
        assert!(!not_found.is_lock_conflict());
        assert!(!TransactionError::InvalidTarget("x".into()).is_lock_conflict());
    }

    #[test]
    fn observer_failure_wraps_its_cause() {
        let cause = TransactionError::DatabaseError(sqlx::Error::RowNotFound);
        let err = TransactionError::ObserverFailed(Box::new(cause));
        assert!(err.to_string().starts_with("Observer failed after commit: Database error"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn display_names_the_failure() {
        let err = TransactionError::InvalidTarget("column \"\" is empty".into());
        assert_eq!(err.to_string(), "Invalid lock target: column \"\" is empty");
    }
}
