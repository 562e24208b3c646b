use postgres_safely_transaction::{Key, KeyValue, Lockable};
use uuid::Uuid;

/// Sample Account entity, locked by its primary key.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
}

impl Account {
    pub fn new(id: i64, owner: &str, balance: i64) -> Self {
        Self {
            id,
            owner: owner.to_string(),
            balance,
        }
    }
}

impl Lockable for Account {
    fn table() -> &'static str {
        "accounts"
    }

    fn key(&self) -> Key {
        Key::single("id", self.id)
    }
}

/// Sample Membership entity with a composite key.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Membership {
    pub tenant_id: i64,
    pub user_id: Uuid,
    pub seats: i32,
}

impl Lockable for Membership {
    fn table() -> &'static str {
        "memberships"
    }

    fn key(&self) -> Key {
        Key::composite([
            ("tenant_id", KeyValue::from(self.tenant_id)),
            ("user_id", KeyValue::from(self.user_id)),
        ])
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("insufficient funds: balance {balance}, requested {requested}")]
pub struct InsufficientFunds {
    pub balance: i64,
    pub requested: i64,
}
