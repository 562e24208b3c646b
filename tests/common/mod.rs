pub mod entities;
pub mod repositories;

pub use entities::{Account, InsufficientFunds, Membership};
pub use repositories::{AccountRepository, FailingObserver, LifecycleProbe};
