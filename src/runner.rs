use log::{debug, warn};
use sqlx::postgres::PgRow;
use sqlx::FromRow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::lock_target::{LockOptions, LockTarget, ResolvedLock};
use crate::transaction_aware::BoxError;
use crate::{
    Executor, TransactionAware, TransactionError, TransactionResult, UnitOfWork, UnitOfWorkSession,
};

/// Boxed future produced by a unit of work.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type WorkFuture<T> = BoxFuture<Result<T, BoxError>>;
type FailureHandler = Box<dyn FnOnce(&TransactionError) + Send>;

/// The callback run inside the transaction.
///
/// Each variant is one supported signature: the callback may ask for the open
/// transaction's [`Executor`], for the locked row, for both, or for nothing.
pub enum Work<R, T> {
    Plain(Box<dyn FnOnce() -> WorkFuture<T> + Send>),
    Row(Box<dyn FnOnce(Option<R>) -> WorkFuture<T> + Send>),
    Executor(Box<dyn FnOnce(Executor) -> WorkFuture<T> + Send>),
    Scoped(Box<dyn FnOnce(Executor, Option<R>) -> WorkFuture<T> + Send>),
}

impl<R: Send + 'static, T: Send + 'static> Work<R, T> {
    pub fn plain<F, Fut, E>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Work::Plain(Box::new(move || {
            Box::pin(async move { f().await.map_err(Into::into) })
        }))
    }

    /// Callback receiving the locked row, or `None` when nothing matched.
    pub fn row<F, Fut, E>(f: F) -> Self
    where
        F: FnOnce(Option<R>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Work::Row(Box::new(move |row| {
            Box::pin(async move { f(row).await.map_err(Into::into) })
        }))
    }

    pub fn executor<F, Fut, E>(f: F) -> Self
    where
        F: FnOnce(Executor) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Work::Executor(Box::new(move |executor| {
            Box::pin(async move { f(executor).await.map_err(Into::into) })
        }))
    }

    pub fn scoped<F, Fut, E>(f: F) -> Self
    where
        F: FnOnce(Executor, Option<R>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Work::Scoped(Box::new(move |executor, row| {
            Box::pin(async move { f(executor, row).await.map_err(Into::into) })
        }))
    }
}

impl<R, T> Work<R, T> {
    fn call(self, executor: Executor, row: Option<R>) -> WorkFuture<T> {
        match self {
            Work::Plain(f) => f(),
            Work::Row(f) => f(row),
            Work::Executor(f) => f(executor),
            Work::Scoped(f) => f(executor, row),
        }
    }
}

impl<R, T> std::fmt::Debug for Work<R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let signature = match self {
            Work::Plain(_) => "Plain",
            Work::Row(_) => "Row",
            Work::Executor(_) => "Executor",
            Work::Scoped(_) => "Scoped",
        };
        f.debug_tuple("Work").field(&signature).finish()
    }
}

/// Row type for runners that never lock anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unlocked;

impl<'r> FromRow<'r, PgRow> for Unlocked {
    fn from_row(_row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Unlocked)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Return the original error from `run` after the failure handler ran.
    pub rethrow: bool,
    pub lock: LockOptions,
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T, R> {
    /// The unit of work's result; `None` when the run failed and the error was
    /// not rethrown.
    pub value: Option<T>,
    /// The locked entity after the run: refreshed with the locked row, or
    /// `None` if no row came back. Always `None` for query targets.
    ///
    /// With [`LockWait::SkipLocked`] a row held by another transaction also
    /// comes back as `None`, so it cannot be told apart from a deleted row.
    ///
    /// [`LockWait::SkipLocked`]: crate::LockWait::SkipLocked
    pub entity: Option<R>,
    pub committed: bool,
}

impl<T, R> Outcome<T, R> {
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn value_or(self, default: T) -> T {
        self.value.unwrap_or(default)
    }
}

/// Runs a unit of work in a transaction, optionally holding a row lock on a
/// single entity or query result while it runs.
///
/// The transaction is committed when the work succeeds and rolled back on any
/// failure, whether it came from acquiring the lock, the work itself or the
/// commit. Failures go to the handler installed with [`on_failure`] and are
/// only returned from [`run`] when rethrow is enabled.
///
/// [`on_failure`]: SafelyTransaction::on_failure
/// [`run`]: SafelyTransaction::run
pub struct SafelyTransaction<U, R, T> {
    uow: U,
    work: Work<R, T>,
    lock: Option<ResolvedLock<R>>,
    on_failure: Option<FailureHandler>,
    config: RunConfig,
    observers: Vec<Arc<dyn TransactionAware>>,
}

impl<U: UnitOfWork, T> SafelyTransaction<U, Unlocked, T> {
    /// Runner without a lock target.
    pub fn unlocked(uow: U, work: Work<Unlocked, T>) -> Self {
        Self::new(uow, work)
    }
}

impl<U: UnitOfWork, R, T> SafelyTransaction<U, R, T> {
    pub fn new(uow: U, work: Work<R, T>) -> Self {
        Self {
            uow,
            work,
            lock: None,
            on_failure: None,
            config: RunConfig::default(),
            observers: Vec::new(),
        }
    }

    /// Constructs a runner and resolves its lock target immediately.
    pub fn with_target(
        uow: U,
        work: Work<R, T>,
        target: impl Into<LockTarget<R>>,
    ) -> TransactionResult<Self> {
        Self::new(uow, work).lock_on(target)
    }

    /// Installs the handler called with the error after a rollback.
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&TransactionError) + Send + 'static,
    {
        self.on_failure = Some(Box::new(handler));
        self
    }

    pub fn set_rethrow(mut self, rethrow: bool) -> Self {
        self.config.rethrow = rethrow;
        self
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn lock_options(mut self, options: LockOptions) -> Self {
        self.config.lock = options;
        self
    }

    /// Replaces the lock target. Fails with `InvalidTarget` before any
    /// transaction is opened.
    pub fn lock_on(mut self, target: impl Into<LockTarget<R>>) -> TransactionResult<Self> {
        self.lock = target.into().resolve()?;
        Ok(self)
    }

    /// Registers a component notified when the run commits or rolls back.
    pub fn observe(mut self, observer: Arc<dyn TransactionAware>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn target(&self) -> Option<&ResolvedLock<R>> {
        self.lock.as_ref()
    }
}

impl<U, R, T> SafelyTransaction<U, R, T>
where
    U: UnitOfWork,
    R: for<'r> FromRow<'r, PgRow> + Clone + Send + Unpin + 'static,
    T: Send + 'static,
{
    /// Begins a transaction, locks the target, runs the work and commits.
    ///
    /// Returns `Err` only when rethrow is enabled; otherwise a failed run
    /// yields an [`Outcome`] without a value. An observer failing after the
    /// commit landed is logged and the run still counts as committed.
    pub async fn run(self) -> TransactionResult<Outcome<T, R>> {
        let SafelyTransaction {
            uow,
            work,
            mut lock,
            on_failure,
            config,
            observers,
        } = self;

        let refreshes = lock.as_ref().map_or(false, ResolvedLock::is_entity);
        let mut entity = lock.as_mut().and_then(|l| l.entity.take());

        let session = match uow.begin().await {
            Ok(session) => session,
            Err(e) => {
                warn!("could not begin transaction: {}", e);
                return settle(e, on_failure, config.rethrow, entity);
            }
        };
        debug!("transaction started");

        for observer in observers {
            session.register_transaction_aware(observer);
        }

        let executor = session.executor().clone();
        let attempt = async {
            let row = match &lock {
                Some(lock) => {
                    let row = lock.fetch(&executor, &config.lock).await?;
                    debug!(
                        "locked {} ({})",
                        lock.selector().table_name(),
                        if row.is_some() { "row found" } else { "no row" }
                    );
                    if refreshes {
                        entity = row.clone();
                    }
                    row
                }
                None => None,
            };
            work.call(executor.clone(), row)
                .await
                .map_err(TransactionError::UnitOfWorkFailed)
        }
        .await;

        match attempt {
            Ok(value) => match session.commit().await {
                Ok(()) => {
                    debug!("transaction committed");
                    Ok(Outcome {
                        value: Some(value),
                        entity,
                        committed: true,
                    })
                }
                Err(TransactionError::ObserverFailed(e)) => {
                    warn!("transaction committed, observer failed: {}", e);
                    Ok(Outcome {
                        value: Some(value),
                        entity,
                        committed: true,
                    })
                }
                Err(e) => {
                    warn!("commit failed: {}", e);
                    settle(e, on_failure, config.rethrow, entity)
                }
            },
            Err(e) => {
                warn!("rolling back transaction: {}", e);
                if let Err(rollback) = session.rollback().await {
                    warn!("rollback failed: {}", rollback);
                }
                settle(e, on_failure, config.rethrow, entity)
            }
        }
    }
}

fn settle<T, R>(
    error: TransactionError,
    handler: Option<FailureHandler>,
    rethrow: bool,
    entity: Option<R>,
) -> TransactionResult<Outcome<T, R>> {
    if let Some(handler) = handler {
        handler(&error);
    }
    if rethrow {
        return Err(error);
    }
    Ok(Outcome {
        value: None,
        entity,
        committed: false,
    })
}
