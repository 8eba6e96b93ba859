//! Persistent entity stores.
//!
//! One [`Database`] per session, one [`Store`] per [`EntityKind`] handed out
//! by the [`StoreFactory`]. Cross-kind consistency is the caller's job: open
//! a [`Transaction`] over every kind involved and use the stores' `*_in`
//! methods.
//!
//! [`EntityKind`]: calbridge_core::EntityKind

mod database;
mod error;
mod factory;
pub mod settings;
mod store;

pub use database::{ChangeOp, Database, StoreChange, Transaction, TransactionMode};
pub use error::{StoreError, StoreResult};
pub use factory::{StoreArgs, StoreFactory, StoreFactoryBuilder};
pub use settings::{SettingWatch, Settings, StoreSettings};
pub use store::{ChangeFeed, DynStore, Store};
