//! Postgres Safely Transaction
//!
//! Runs a unit of work inside a PostgreSQL transaction, optionally holding a
//! `SELECT ... FOR UPDATE` lock on one entity or query result while it runs.
//! The transaction is committed on success and rolled back on any failure;
//! failures are reported to an optional handler and only propagated when
//! rethrow is enabled.
//!
//! ```ignore
//! let outcome = uow
//!     .safely(Work::row(|account: Option<Account>| async move {
//!         let account = account.ok_or(AccountMissing)?;
//!         Ok::<_, AccountMissing>(account.balance - 10)
//!     }))
//!     .lock_on(LockTarget::entity(account))?
//!     .set_rethrow(true)
//!     .run()
//!     .await?;
//! ```

pub mod executor;
pub mod lock_target;
pub mod runner;
pub mod transaction_aware;
pub mod unit_of_work;

pub use executor::Executor;
pub use lock_target::{
    Comparison, Direction, EntityRef, Filter, Key, KeyValue, LockOptions, LockStrength, LockTarget,
    LockWait, Lockable, ResolvedLock, Selector,
};
pub use runner::{BoxFuture, Outcome, RunConfig, SafelyTransaction, Unlocked, Work};
pub use transaction_aware::{BoxError, TransactionAware, TransactionError, TransactionResult};
pub use unit_of_work::{
    PostgresUnitOfWork, PostgresUnitOfWorkSession, UnitOfWork, UnitOfWorkSession,
};
