//! Typed stores.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use calbridge_core::{BoxFuture, Entity, EntityKind};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::database::{Database, StoreChange, Transaction, TransactionMode};
use crate::error::{StoreError, StoreResult};
use crate::factory::StoreArgs;

/// Accessor for the records of one kind.
///
/// Stores never open transactions over other kinds. Writes that must land
/// together with other kinds go through the `*_in` variants inside a
/// caller-owned [`Transaction`].
pub struct Store<T> {
    db: Database,
    _record: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Store<T>
where
    T: Entity,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("kind", &T::KIND)
            .field("db", &self.db.name())
            .finish()
    }
}

impl<T: Entity> Store<T> {
    pub fn new(args: StoreArgs) -> Self {
        Self {
            db: args.db,
            _record: PhantomData,
        }
    }

    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<T>> {
        let tx = self.db.transaction(&[T::KIND], TransactionMode::ReadOnly).await;
        self.get_in(&tx, id)
    }

    pub async fn all(&self) -> StoreResult<Vec<T>> {
        let tx = self.db.transaction(&[T::KIND], TransactionMode::ReadOnly).await;
        self.all_in(&tx)
    }

    /// Inserts or replaces `record`.
    pub async fn persist(&self, record: &T) -> StoreResult<()> {
        let mut tx = self.db.transaction(&[T::KIND], TransactionMode::ReadWrite).await;
        self.persist_in(&mut tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a record was removed.
    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        let mut tx = self.db.transaction(&[T::KIND], TransactionMode::ReadWrite).await;
        let existed = self.remove_in(&mut tx, id)?;
        tx.commit()?;
        Ok(existed)
    }

    pub fn get_in(&self, tx: &Transaction, id: &str) -> StoreResult<Option<T>> {
        tx.get(T::KIND, id)?
            .map(|value| decode::<T>(id, value))
            .transpose()
    }

    pub fn all_in(&self, tx: &Transaction) -> StoreResult<Vec<T>> {
        tx.all(T::KIND)?
            .into_iter()
            .map(|value| decode::<T>("", value))
            .collect()
    }

    pub fn filter_in<F>(&self, tx: &Transaction, keep: F) -> StoreResult<Vec<T>>
    where
        F: Fn(&T) -> bool,
    {
        let mut records = self.all_in(tx)?;
        records.retain(|record| keep(record));
        Ok(records)
    }

    pub fn persist_in(&self, tx: &mut Transaction, record: &T) -> StoreResult<()> {
        let value = serde_json::to_value(record)?;
        tx.put(T::KIND, record.id(), value)
    }

    pub fn remove_in(&self, tx: &mut Transaction, id: &str) -> StoreResult<bool> {
        tx.delete(T::KIND, id)
    }

    /// Committed changes to this kind.
    pub fn changes(&self) -> ChangeFeed {
        ChangeFeed {
            kind: T::KIND,
            rx: self.db.subscribe(),
        }
    }
}

fn decode<T: Entity>(id: &str, value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|source| StoreError::Decode {
        kind: T::KIND,
        id: id.to_string(),
        source,
    })
}

/// Change feed filtered to one kind.
pub struct ChangeFeed {
    kind: EntityKind,
    rx: broadcast::Receiver<StoreChange>,
}

impl ChangeFeed {
    /// Next change, or `None` once the database is gone.
    ///
    /// A lagging receiver skips what it missed and keeps going.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.kind == self.kind => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(kind = %self.kind, skipped, "change feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Type-erased store, as handed out by [`StoreFactory::get_store`].
///
/// [`StoreFactory::get_store`]: crate::StoreFactory::get_store
pub trait DynStore: Send + Sync + 'static {
    fn kind(&self) -> EntityKind;

    fn get_json<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>>;

    fn all_json(&self) -> BoxFuture<'_, StoreResult<Vec<Value>>>;

    /// Validates `record` against the kind's schema, then upserts it.
    fn persist_json(&self, record: Value) -> BoxFuture<'_, StoreResult<()>>;

    fn remove_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> DynStore for Store<T> {
    fn kind(&self) -> EntityKind {
        T::KIND
    }

    fn get_json<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>> {
        Box::pin(async move {
            match self.get(id).await? {
                Some(record) => Ok(Some(serde_json::to_value(record)?)),
                None => Ok(None),
            }
        })
    }

    fn all_json(&self) -> BoxFuture<'_, StoreResult<Vec<Value>>> {
        Box::pin(async move {
            self.all()
                .await?
                .into_iter()
                .map(|record| serde_json::to_value(record).map_err(StoreError::from))
                .collect()
        })
    }

    fn persist_json(&self, record: Value) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let record = decode::<T>(&id, record)?;
            self.persist(&record).await
        })
    }

    fn remove_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(self.remove(id))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
