use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use postgres_safely_transaction::{Executor, TransactionAware, TransactionError, TransactionResult};

use super::entities::Account;

/// Account repository working inside a runner's transaction.
pub struct AccountRepository {
    executor: Executor,
}

impl AccountRepository {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub async fn set_balance(&self, id: i64, balance: i64) -> TransactionResult<()> {
        let mut tx_guard = self.executor.tx.lock().await;
        let tx = tx_guard.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(balance)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn insert(&self, account: &Account) -> TransactionResult<()> {
        let mut tx_guard = self.executor.tx.lock().await;
        let tx = tx_guard.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        sqlx::query("INSERT INTO accounts (id, owner, balance) VALUES ($1, $2, $3)")
            .bind(account.id)
            .bind(&account.owner)
            .bind(account.balance)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Seeds a row outside any runner.
    pub async fn seed(pool: &PgPool, account: &Account) {
        sqlx::query("INSERT INTO accounts (id, owner, balance) VALUES ($1, $2, $3)")
            .bind(account.id)
            .bind(&account.owner)
            .bind(account.balance)
            .execute(pool)
            .await
            .expect("Failed to seed account");
    }

    /// Reads a row outside any runner.
    pub async fn find(pool: &PgPool, id: i64) -> Option<Account> {
        let row = sqlx::query("SELECT id, owner, balance FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .expect("Failed to query account");

        row.map(|r| Account {
            id: r.get("id"),
            owner: r.get("owner"),
            balance: r.get("balance"),
        })
    }
}

/// Observer recording which lifecycle callbacks fired.
#[derive(Default)]
pub struct LifecycleProbe {
    committed: RwLock<u32>,
    rolled_back: RwLock<u32>,
}

impl LifecycleProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commits(&self) -> u32 {
        *self.committed.read()
    }

    pub fn rollbacks(&self) -> u32 {
        *self.rolled_back.read()
    }
}

#[async_trait]
impl TransactionAware for LifecycleProbe {
    async fn on_commit(&self) -> TransactionResult<()> {
        *self.committed.write() += 1;
        Ok(())
    }

    async fn on_rollback(&self) -> TransactionResult<()> {
        *self.rolled_back.write() += 1;
        Ok(())
    }
}

/// Observer whose commit callback always fails.
pub struct FailingObserver;

#[async_trait]
impl TransactionAware for FailingObserver {
    async fn on_commit(&self) -> TransactionResult<()> {
        Err(TransactionError::DatabaseError(sqlx::Error::RowNotFound))
    }

    async fn on_rollback(&self) -> TransactionResult<()> {
        Ok(())
    }
}
