//! Lock targets and the "refetch with lock" query they resolve into.

use sqlx::postgres::PgRow;
use sqlx::{FromRow, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{Executor, TransactionError, TransactionResult};

/// A scalar value bound into a lock query.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Int(i64),
    SmallInt(i32),
    Text(String),
    Bool(bool),
    Uuid(Uuid),
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::SmallInt(v)
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

impl From<Uuid> for KeyValue {
    fn from(v: Uuid) -> Self {
        KeyValue::Uuid(v)
    }
}

/// Identifier of an entity, possibly spanning several columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Single { column: String, value: KeyValue },
    Composite(Vec<(String, KeyValue)>),
}

impl Key {
    pub fn single(column: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Key::Single {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn composite<C, V>(parts: impl IntoIterator<Item = (C, V)>) -> Self
    where
        C: Into<String>,
        V: Into<KeyValue>,
    {
        Key::Composite(
            parts
                .into_iter()
                .map(|(c, v)| (c.into(), v.into()))
                .collect(),
        )
    }

    fn into_parts(self) -> Vec<(String, KeyValue)> {
        match self {
            Key::Single { column, value } => vec![(column, value)],
            Key::Composite(parts) => parts,
        }
    }
}

/// A row type that knows how to re-fetch itself by its key.
///
/// Implemented by entity structs so they can be handed to a runner as a lock
/// target and refreshed with the locked row.
pub trait Lockable: for<'r> FromRow<'r, PgRow> + Clone + Send + Sync + Unpin + 'static {
    /// Backing table, optionally schema-qualified (`billing.accounts`).
    fn table() -> &'static str;

    /// Current identifier of this instance.
    fn key(&self) -> Key;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn as_sql(self) -> &'static str {
        match self {
            Comparison::Eq => " = ",
            Comparison::Ne => " <> ",
            Comparison::Lt => " < ",
            Comparison::Le => " <= ",
            Comparison::Gt => " > ",
            Comparison::Ge => " >= ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub comparison: Comparison,
    pub value: KeyValue,
}

/// A filtered selection over one table, expected to match zero or one row.
///
/// Only the first row (after `order_by`) is locked and fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    table: String,
    columns: Vec<String>,
    filters: Vec<Filter>,
    order: Vec<(String, Direction)>,
}

impl Selector {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Adds an equality filter.
    pub fn filter(self, column: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.filter_op(column, Comparison::Eq, value)
    }

    pub fn filter_op(
        mut self,
        column: impl Into<String>,
        comparison: Comparison,
        value: impl Into<KeyValue>,
    ) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            comparison,
            value: value.into(),
        });
        self
    }

    /// Restricts the selected columns; all columns are selected by default.
    pub fn columns<C: Into<String>>(mut self, columns: impl IntoIterator<Item = C>) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push((column.into(), direction));
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    fn validate(&self) -> TransactionResult<()> {
        validate_identifier(&self.table, true)?;
        for column in &self.columns {
            validate_identifier(column, false)?;
        }
        for filter in &self.filters {
            validate_identifier(&filter.column, false)?;
        }
        for (column, _) in &self.order {
            validate_identifier(column, false)?;
        }
        Ok(())
    }
}

/// Row lock strength, mapped to the Postgres locking clause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockStrength {
    #[default]
    Update,
    NoKeyUpdate,
    Share,
    KeyShare,
}

/// What to do when another transaction already holds a conflicting lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockWait {
    /// Wait until the lock is released (or the connection's lock_timeout fires).
    #[default]
    Block,
    NoWait,
    /// Treat locked rows as absent.
    SkipLocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    pub strength: LockStrength,
    pub wait: LockWait,
}

impl LockOptions {
    fn push_clause(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        qb.push(match self.strength {
            LockStrength::Update => " FOR UPDATE",
            LockStrength::NoKeyUpdate => " FOR NO KEY UPDATE",
            LockStrength::Share => " FOR SHARE",
            LockStrength::KeyShare => " FOR KEY SHARE",
        });
        match self.wait {
            LockWait::Block => {}
            LockWait::NoWait => {
                qb.push(" NOWAIT");
            }
            LockWait::SkipLocked => {
                qb.push(" SKIP LOCKED");
            }
        }
    }
}

/// An entity handed over as a lock target, with its identifier captured.
#[derive(Debug, Clone)]
pub struct EntityRef<R> {
    entity: R,
    table: &'static str,
    key: Key,
}

impl<R: Lockable> EntityRef<R> {
    pub fn new(entity: R) -> Self {
        let key = entity.key();
        Self {
            entity,
            table: R::table(),
            key,
        }
    }
}

impl<R> EntityRef<R> {
    pub fn entity(&self) -> &R {
        &self.entity
    }
}

/// What a runner locks before calling the unit of work.
#[derive(Debug, Clone)]
pub enum LockTarget<R> {
    None,
    Entity(EntityRef<R>),
    Query(Selector),
}

impl<R: Lockable> LockTarget<R> {
    pub fn entity(entity: R) -> Self {
        LockTarget::Entity(EntityRef::new(entity))
    }
}

impl<R> LockTarget<R> {
    pub fn query(selector: Selector) -> Self {
        LockTarget::Query(selector)
    }

    /// Normalizes the target into a validated lock query, remembering the
    /// entity when there is one.
    pub fn resolve(self) -> TransactionResult<Option<ResolvedLock<R>>> {
        let resolved = match self {
            LockTarget::None => return Ok(None),
            LockTarget::Entity(EntityRef { entity, table, key }) => {
                let parts = key.into_parts();
                if parts.is_empty() {
                    return Err(TransactionError::InvalidTarget(format!(
                        "entity of table {table:?} has an empty key"
                    )));
                }
                for (i, (column, _)) in parts.iter().enumerate() {
                    if parts[..i].iter().any(|(c, _)| c == column) {
                        return Err(TransactionError::InvalidTarget(format!(
                            "key column {column:?} repeated"
                        )));
                    }
                }
                let selector = parts
                    .into_iter()
                    .fold(Selector::table(table), |s, (column, value)| s.filter(column, value));
                ResolvedLock {
                    selector,
                    entity: Some(entity),
                }
            }
            LockTarget::Query(selector) => ResolvedLock {
                selector,
                entity: None,
            },
        };
        resolved.selector.validate()?;
        Ok(Some(resolved))
    }
}

impl<R> From<Selector> for LockTarget<R> {
    fn from(selector: Selector) -> Self {
        LockTarget::Query(selector)
    }
}

impl<R> From<EntityRef<R>> for LockTarget<R> {
    fn from(entity: EntityRef<R>) -> Self {
        LockTarget::Entity(entity)
    }
}

/// A lock target after validation: the selector to re-fetch with a lock and,
/// for entity targets, the entity to refresh in place.
#[derive(Debug, Clone)]
pub struct ResolvedLock<R> {
    pub(crate) selector: Selector,
    pub(crate) entity: Option<R>,
}

impl<R> ResolvedLock<R> {
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn entity(&self) -> Option<&R> {
        self.entity.as_ref()
    }

    pub fn is_entity(&self) -> bool {
        self.entity.is_some()
    }

    /// Renders the `SELECT ... LIMIT 1 FOR UPDATE` statement with bound values.
    pub fn query(&self, options: &LockOptions) -> QueryBuilder<'static, Postgres> {
        let s = &self.selector;
        let mut qb = QueryBuilder::new("SELECT ");
        if s.columns.is_empty() {
            qb.push("*");
        } else {
            for (i, column) in s.columns.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push(quote_identifier(column));
            }
        }
        qb.push(" FROM ").push(quote_identifier(&s.table));

        for (i, filter) in s.filters.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            qb.push(quote_identifier(&filter.column));
            qb.push(filter.comparison.as_sql());
            push_value(&mut qb, &filter.value);
        }

        for (i, (column, direction)) in s.order.iter().enumerate() {
            qb.push(if i == 0 { " ORDER BY " } else { ", " });
            qb.push(quote_identifier(column));
            qb.push(match direction {
                Direction::Asc => " ASC",
                Direction::Desc => " DESC",
            });
        }

        qb.push(" LIMIT 1");
        options.push_clause(&mut qb);
        qb
    }
}

impl<R> ResolvedLock<R>
where
    R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    /// Re-fetches the target inside the executor's transaction with a row lock.
    ///
    /// No matching row is `Ok(None)`; the database refusing the lock is
    /// `LockAcquisitionFailed`.
    pub async fn fetch(
        &self,
        executor: &Executor,
        options: &LockOptions,
    ) -> TransactionResult<Option<R>> {
        let mut query = self.query(options);
        executor
            .fetch_optional::<R>(&mut query)
            .await
            .map_err(|e| match e {
                TransactionError::DatabaseError(e) => TransactionError::LockAcquisitionFailed(e),
                other => other,
            })
    }
}

fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &KeyValue) {
    match value {
        KeyValue::Int(v) => qb.push_bind(*v),
        KeyValue::SmallInt(v) => qb.push_bind(*v),
        KeyValue::Text(v) => qb.push_bind(v.clone()),
        KeyValue::Bool(v) => qb.push_bind(*v),
        KeyValue::Uuid(v) => qb.push_bind(*v),
    };
}

/// Accepts `name` or, when `qualified`, `schema.name`; each part must be a
/// plain SQL identifier.
fn validate_identifier(ident: &str, qualified: bool) -> TransactionResult<()> {
    let parts: Vec<&str> = ident.split('.').collect();
    if parts.len() > 2 || (parts.len() == 2 && !qualified) {
        return Err(TransactionError::InvalidTarget(format!(
            "{ident:?} is not a valid identifier"
        )));
    }
    for part in parts {
        let mut chars = part.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        if !valid {
            return Err(TransactionError::InvalidTarget(format!(
                "{ident:?} is not a valid identifier"
            )));
        }
    }
    Ok(())
}

fn quote_identifier(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}
