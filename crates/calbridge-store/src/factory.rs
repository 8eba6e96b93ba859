//! Store factory.
//!
//! The factory hands out exactly one store per kind for the lifetime of the
//! factory. Stores are built lazily, on first request, from a registered
//! constructor and arguments derived from the shared [`Database`].
//! Concurrent first requests for one kind are serialized by a per-kind
//! [`OnceCell`]: one caller constructs, the others await the same instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use calbridge_core::{
    Account, Alarm, Busytime, Calendar, Entity, EntityKind, Event, IcalComponent, Setting,
};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::store::{DynStore, Store};

/// Arguments every store constructor receives.
#[derive(Debug, Clone)]
pub struct StoreArgs {
    pub db: Database,
    pub kind: EntityKind,
}

type Constructor = Arc<dyn Fn(StoreArgs) -> Arc<dyn DynStore> + Send + Sync>;
type ArgsFn = Arc<dyn Fn(&Database, EntityKind) -> StoreArgs + Send + Sync>;

fn default_args(db: &Database, kind: EntityKind) -> StoreArgs {
    StoreArgs {
        db: db.clone(),
        kind,
    }
}

fn typed<T: Entity>() -> Constructor {
    Arc::new(|args| Arc::new(Store::<T>::new(args)) as Arc<dyn DynStore>)
}

pub struct StoreFactory {
    db: Database,
    derive_args: ArgsFn,
    constructors: HashMap<EntityKind, Constructor>,
    cells: HashMap<EntityKind, OnceCell<Arc<dyn DynStore>>>,
}

impl fmt::Debug for StoreFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("StoreFactory")
            .field("db", &self.db)
            .field("kinds", &kinds)
            .finish()
    }
}

impl StoreFactory {
    /// Factory with the standard store of every kind registered.
    pub fn new(db: Database) -> Self {
        Self::builder(db)
            .register::<Account>()
            .register::<Alarm>()
            .register::<Busytime>()
            .register::<Calendar>()
            .register::<Event>()
            .register::<IcalComponent>()
            .register::<Setting>()
            .build()
    }

    pub fn builder(db: Database) -> StoreFactoryBuilder {
        StoreFactoryBuilder {
            db,
            derive_args: Arc::new(default_args),
            constructors: HashMap::new(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The store for `kind`, constructing it on first use.
    pub async fn get_store(&self, kind: EntityKind) -> StoreResult<Arc<dyn DynStore>> {
        let (Some(cell), Some(constructor)) = (self.cells.get(&kind), self.constructors.get(&kind))
        else {
            return Err(StoreError::UnregisteredKind(kind));
        };

        let store = cell
            .get_or_init(|| async {
                debug!(%kind, "constructing store");
                constructor((self.derive_args)(&self.db, kind))
            })
            .await;
        Ok(store.clone())
    }

    /// Looks up a store by its kind's canonical name.
    pub async fn get_store_named(&self, name: &str) -> StoreResult<Arc<dyn DynStore>> {
        let kind: EntityKind = name.parse()?;
        self.get_store(kind).await
    }

    /// The typed store for `T`.
    pub async fn store<T: Entity>(&self) -> StoreResult<Arc<Store<T>>> {
        self.get_store(T::KIND)
            .await?
            .as_any()
            .downcast::<Store<T>>()
            .map_err(|_| StoreError::TypeMismatch(T::KIND))
    }

    /// Whether the store for `kind` has been built yet.
    pub fn is_constructed(&self, kind: EntityKind) -> bool {
        self.cells
            .get(&kind)
            .is_some_and(|cell| cell.initialized())
    }
}

pub struct StoreFactoryBuilder {
    db: Database,
    derive_args: ArgsFn,
    constructors: HashMap<EntityKind, Constructor>,
}

impl StoreFactoryBuilder {
    /// Registers the standard [`Store`] for `T`.
    pub fn register<T: Entity>(mut self) -> Self {
        self.constructors.insert(T::KIND, typed::<T>());
        self
    }

    /// Registers a custom constructor for `kind`.
    pub fn register_with<F>(mut self, kind: EntityKind, constructor: F) -> Self
    where
        F: Fn(StoreArgs) -> Arc<dyn DynStore> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(constructor));
        self
    }

    /// Replaces the argument derivation.
    pub fn args<F>(mut self, derive: F) -> Self
    where
        F: Fn(&Database, EntityKind) -> StoreArgs + Send + Sync + 'static,
    {
        self.derive_args = Arc::new(derive);
        self
    }

    pub fn build(self) -> StoreFactory {
        let cells = self
            .constructors
            .keys()
            .map(|kind| (*kind, OnceCell::new()))
            .collect();
        StoreFactory {
            db: self.db,
            derive_args: self.derive_args,
            constructors: self.constructors,
            cells,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_factory(calls: Arc<AtomicUsize>) -> Arc<StoreFactory> {
        let constructor = typed::<Event>();
        Arc::new(
            StoreFactory::builder(Database::open("test"))
                .register_with(EntityKind::Event, move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    constructor(args)
                })
                .register::<Setting>()
                .build(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_instance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(calls.clone());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let factory = factory.clone();
                tokio::spawn(async move { factory.get_store(EntityKind::Event).await.unwrap() })
            })
            .collect();

        let mut stores = Vec::new();
        for handle in handles {
            stores.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for store in &stores[1..] {
            assert!(Arc::ptr_eq(&stores[0], store));
        }
    }

    #[tokio::test]
    async fn stores_are_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(calls.clone());
        assert!(!factory.is_constructed(EntityKind::Event));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        factory.get_store(EntityKind::Event).await.unwrap();
        assert!(factory.is_constructed(EntityKind::Event));
        assert!(!factory.is_constructed(EntityKind::Setting));
    }

    #[tokio::test]
    async fn unregistered_kind_is_an_error() {
        let factory = counting_factory(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            factory.get_store(EntityKind::Alarm).await,
            Err(StoreError::UnregisteredKind(EntityKind::Alarm))
        ));
        assert!(matches!(
            factory.get_store_named("Alarms").await,
            Err(StoreError::UnknownKind(_))
        ));
    }

    #[tokio::test]
    async fn typed_and_erased_handles_are_the_same_store() {
        let factory = StoreFactory::new(Database::open("test"));
        let typed = factory.store::<Setting>().await.unwrap();
        let erased = factory.get_store_named("Setting").await.unwrap();
        assert_eq!(erased.kind(), EntityKind::Setting);

        typed
            .persist(&Setting::new("offlineRetry", serde_json::json!([])))
            .await
            .unwrap();
        assert!(erased.get_json("offlineRetry").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn custom_args_are_passed_to_constructors() {
        let other = Database::open("other");
        let factory = StoreFactory::builder(Database::open("main"))
            .register::<Setting>()
            .args(move |_, kind| StoreArgs {
                db: other.clone(),
                kind,
            })
            .build();
        let settings = factory.store::<Setting>().await.unwrap();
        assert_eq!(settings.database().name(), "other");
    }

    #[tokio::test]
    async fn wrong_record_type_is_a_mismatch() {
        let constructor = typed::<Setting>();
        let factory = StoreFactory::builder(Database::open("test"))
            .register_with(EntityKind::Event, move |args| constructor(args))
            .build();
        assert!(matches!(
            factory.store::<Event>().await,
            Err(StoreError::TypeMismatch(EntityKind::Event))
        ));
    }
}
