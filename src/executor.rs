use sqlx::postgres::PgRow;
use sqlx::{FromRow, Postgres, QueryBuilder, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::TransactionResult;

/// Executor wraps the open database transaction of a run.
///
/// It is the handle a unit of work uses to issue its own statements inside
/// the same transaction that holds the row lock. Clones share the transaction.
#[derive(Clone, Debug)]
pub struct Executor {
    pub tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl Executor {
    /// Creates a new Executor from a PostgreSQL transaction.
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Whether the transaction is still held (not yet committed or rolled back).
    pub async fn is_active(&self) -> bool {
        self.tx.lock().await.is_some()
    }

    /// Runs a built query and decodes at most one row.
    pub(crate) async fn fetch_optional<R>(
        &self,
        query: &mut QueryBuilder<'_, Postgres>,
    ) -> TransactionResult<Option<R>>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let mut tx_guard = self.tx.lock().await;
        let tx = tx_guard.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        let row = query.build_query_as::<R>().fetch_optional(&mut **tx).await?;
        Ok(row)
    }

    /// Takes ownership of the transaction, leaving None in its place.
    /// This should only be called when committing or rolling back.
    pub(crate) async fn take_transaction(
        &self,
    ) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.tx.lock().await.take().ok_or(sqlx::Error::PoolClosed)
    }
}
