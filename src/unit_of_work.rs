use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::RwLock;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;

use crate::{
    Executor, SafelyTransaction, TransactionAware, TransactionError, TransactionResult, Work,
};

/// Unit of Work pattern for managing database transactions.
///
/// The UnitOfWork is the factory a runner opens its transaction from.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Session: UnitOfWorkSession;

    /// Begin a new transaction session.
    async fn begin(&self) -> TransactionResult<Self::Session>;
}

/// Represents a single database transaction session.
///
/// This trait provides the core transaction management operations and a
/// mechanism to register transaction-aware components that need to be
/// notified of transaction lifecycle events.
#[async_trait]
pub trait UnitOfWorkSession: Send + Sync {
    /// Get the executor for this session (provides access to the transaction).
    fn executor(&self) -> &Executor;

    fn register_transaction_aware(&self, observer: Arc<dyn TransactionAware>);

    /// Commit the transaction and notify all registered observers.
    ///
    /// A failed database commit is `CommitFailed`. Once the commit has landed,
    /// every observer is still notified and the first observer error comes
    /// back as `ObserverFailed`.
    async fn commit(self) -> TransactionResult<()>;

    /// Rollback the transaction and notify all registered observers.
    async fn rollback(self) -> TransactionResult<()>;
}

/// PostgreSQL UnitOfWork over a shared connection pool.
#[derive(Clone, Debug)]
pub struct PostgresUnitOfWork {
    pool: Arc<PgPool>,
}

impl PostgresUnitOfWork {
    /// Create a new PostgresUnitOfWork with the given connection pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(Arc::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Starts configuring a [`SafelyTransaction`] that runs `work` on this pool.
    pub fn safely<R, T>(&self, work: Work<R, T>) -> SafelyTransaction<Self, R, T> {
        SafelyTransaction::new(self.clone(), work)
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    type Session = PostgresUnitOfWorkSession;

    async fn begin(&self) -> TransactionResult<Self::Session> {
        let tx = self.pool.begin().await?;
        Ok(PostgresUnitOfWorkSession::new(tx))
    }
}

/// PostgreSQL session: one open transaction plus its observers.
pub struct PostgresUnitOfWorkSession {
    executor: Executor,
    observers: Arc<RwLock<Vec<Arc<dyn TransactionAware>>>>,
}

impl PostgresUnitOfWorkSession {
    /// Create a new session from a PostgreSQL transaction.
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            executor: Executor::new(tx),
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn observers(&self) -> Vec<Arc<dyn TransactionAware>> {
        self.observers.read().clone()
    }
}

#[async_trait]
impl UnitOfWorkSession for PostgresUnitOfWorkSession {
    fn executor(&self) -> &Executor {
        &self.executor
    }

    fn register_transaction_aware(&self, observer: Arc<dyn TransactionAware>) {
        self.observers.write().push(observer);
    }

    async fn commit(self) -> TransactionResult<()> {
        let tx = self.executor.take_transaction().await?;
        tx.commit().await.map_err(TransactionError::CommitFailed)?;

        let observers = self.observers();
        debug!("notifying {} observer(s) of commit", observers.len());
        let mut first_failure = None;
        for observer in observers.iter() {
            if let Err(e) = observer.on_commit().await {
                warn!("observer failed after commit: {}", e);
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(TransactionError::ObserverFailed(Box::new(e))),
            None => Ok(()),
        }
    }

    async fn rollback(self) -> TransactionResult<()> {
        let tx = self.executor.take_transaction().await?;
        tx.rollback().await.map_err(TransactionError::RollbackFailed)?;

        let observers = self.observers();
        debug!("notifying {} observer(s) of rollback", observers.len());
        for observer in observers.iter() {
            observer.on_rollback().await?;
        }
        Ok(())
    }
}
