//! The persistence handle.
//!
//! A [`Database`] keeps one table of JSON records per [`EntityKind`]. All
//! access goes through a [`Transaction`] scoped to a set of kinds; a
//! read-write transaction holds the writer lock of each kind it covers until
//! it is committed or dropped, so each kind has at most one writer at a time.
//!
//! Databases opened with [`Database::open_at`] keep a JSON snapshot of all
//! tables on disk and reload it on open. Commits only mark the snapshot
//! stale; a background flusher rewrites it (temp file plus rename) once
//! commits settle for [`FLUSH_DELAY`], or when [`Database::flush`] asks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use calbridge_core::EntityKind;
use serde_json::Value;
use tokio::sync::{Notify, OwnedMutexGuard, broadcast, watch};
use tracing::{debug, trace, warn};

use crate::error::{StoreError, StoreResult};

type Table = BTreeMap<String, Value>;
type Tables = HashMap<EntityKind, Table>;
type WriteSet = BTreeMap<(EntityKind, String), Option<Value>>;

const CHANGE_CAPACITY: usize = 256;

/// Quiet period after a commit before the snapshot is rewritten.
pub const FLUSH_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Added,
    Updated,
    Removed,
}

/// One committed record change, published after the commit lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub kind: EntityKind,
    pub id: String,
    pub op: ChangeOp,
}

struct Shared {
    name: String,
    path: Option<PathBuf>,
    tables: Arc<Mutex<Tables>>,
    writers: HashMap<EntityKind, Arc<tokio::sync::Mutex<()>>>,
    changes: broadcast::Sender<StoreChange>,
    persist: Option<Persist>,
}

/// Database side of the snapshot flusher.
struct Persist {
    /// Bumped by every commit that changed something.
    committed: watch::Sender<u64>,
    flushed: watch::Receiver<Flushed>,
    flush_now: Arc<Notify>,
}

#[derive(Debug, Clone, Default)]
struct Flushed {
    /// Last commit generation on disk.
    generation: u64,
    writes: u64,
    /// Failure of the last attempt, cleared by the next success.
    error: Option<String>,
}

/// Cloneable handle to one open database.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.name)
            .field("path", &self.shared.path)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Database {
    /// Opens a purely in-memory database.
    pub fn open(name: impl Into<String>) -> Self {
        Self::with_tables(name.into(), None, Tables::new())
    }

    /// Opens the database stored as `dir/<name>.json`, creating it if needed.
    ///
    /// Must be called inside a tokio runtime; the snapshot flusher runs on it.
    pub fn open_at(dir: impl AsRef<Path>, name: impl Into<String>) -> StoreResult<Self> {
        let name = name.into();
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", name));
        let tables = if path.exists() {
            load_snapshot(&path)?
        } else {
            Tables::new()
        };
        debug!(path = %path.display(), kinds = tables.len(), "opened database");
        Ok(Self::with_tables(name, Some(path), tables))
    }

    fn with_tables(name: String, path: Option<PathBuf>, tables: Tables) -> Self {
        let writers = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let tables = Arc::new(Mutex::new(tables));
        let persist = path.as_ref().map(|path| Flusher::spawn(path.clone(), tables.clone()));
        Self {
            shared: Arc::new(Shared {
                name,
                path,
                tables,
                writers,
                changes,
                persist,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    /// Starts a transaction over `kinds`.
    ///
    /// Read-write transactions wait for the writer lock of every covered
    /// kind, taken in [`EntityKind`] order.
    pub async fn transaction(&self, kinds: &[EntityKind], mode: TransactionMode) -> Transaction {
        let scope: BTreeSet<EntityKind> = kinds.iter().copied().collect();
        let mut locks = Vec::new();
        if mode == TransactionMode::ReadWrite {
            for kind in &scope {
                if let Some(writer) = self.shared.writers.get(kind) {
                    locks.push(writer.clone().lock_owned().await);
                }
            }
        }
        trace!(?scope, ?mode, "transaction started");
        Transaction {
            db: self.clone(),
            scope,
            mode,
            writes: WriteSet::new(),
            locks,
        }
    }

    /// Every committed change, all kinds.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.shared.changes.subscribe()
    }

    /// Waits until every commit made so far is in the snapshot. A no-op for
    /// in-memory databases.
    pub async fn flush(&self) -> StoreResult<()> {
        let Some(persist) = &self.shared.persist else {
            return Ok(());
        };
        let target = *persist.committed.borrow();
        let mut flushed = persist.flushed.clone();
        loop {
            if flushed.borrow_and_update().generation >= target {
                return Ok(());
            }
            persist.flush_now.notify_one();
            if flushed.changed().await.is_err() {
                return Err(StoreError::Flush("snapshot flusher stopped".to_string()));
            }
            let state = flushed.borrow_and_update();
            if state.generation >= target {
                return Ok(());
            }
            if let Some(ref error) = state.error {
                return Err(StoreError::Flush(error.clone()));
            }
        }
    }

    /// Snapshot rewrites so far.
    pub fn snapshot_writes(&self) -> u64 {
        self.shared
            .persist
            .as_ref()
            .map_or(0, |persist| persist.flushed.borrow().writes)
    }

    fn read(&self, kind: EntityKind, id: &str) -> Option<Value> {
        lock(&self.shared.tables)
            .get(&kind)
            .and_then(|table| table.get(id))
            .cloned()
    }

    fn read_all(&self, kind: EntityKind) -> Table {
        lock(&self.shared.tables)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    fn apply(&self, writes: WriteSet) -> StoreResult<Vec<StoreChange>> {
        let mut tables = lock(&self.shared.tables);
        let mut staged: Tables = HashMap::new();
        let mut changes = Vec::new();

        for ((kind, id), value) in writes {
            let table = staged
                .entry(kind)
                .or_insert_with(|| tables.get(&kind).cloned().unwrap_or_default());
            let op = match value {
                Some(value) => match table.insert(id.clone(), value) {
                    Some(_) => ChangeOp::Updated,
                    None => ChangeOp::Added,
                },
                None => match table.remove(&id) {
                    Some(_) => ChangeOp::Removed,
                    None => continue,
                },
            };
            changes.push(StoreChange { kind, id, op });
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        tables.extend(staged);
        drop(tables);
        if let Some(persist) = &self.shared.persist {
            persist.committed.send_modify(|generation| *generation += 1);
        }

        debug!(db = %self.shared.name, changes = changes.len(), "committed");
        for change in &changes {
            // No receivers is fine.
            let _ = self.shared.changes.send(change.clone());
        }
        Ok(changes)
    }
}

fn load_snapshot(path: &Path) -> StoreResult<Tables> {
    let content = std::fs::read_to_string(path)?;
    let raw: BTreeMap<String, Table> = serde_json::from_str(&content)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;

    let mut tables = Tables::new();
    for (name, table) in raw {
        match name.parse::<EntityKind>() {
            Ok(kind) => {
                tables.insert(kind, table);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping table"),
        }
    }
    Ok(tables)
}

fn encode_snapshot(tables: &Tables) -> StoreResult<Vec<u8>> {
    let snapshot: BTreeMap<&str, &Table> = EntityKind::ALL
        .iter()
        .filter_map(|kind| tables.get(kind).map(|table| (kind.as_str(), table)))
        .collect();
    Ok(serde_json::to_vec(&snapshot)?)
}

fn write_snapshot(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Rewrites the snapshot of one database after its commits settle.
struct Flusher {
    path: PathBuf,
    tables: Arc<Mutex<Tables>>,
    committed: watch::Receiver<u64>,
    flushed: watch::Sender<Flushed>,
    flush_now: Arc<Notify>,
}

impl Flusher {
    fn spawn(path: PathBuf, tables: Arc<Mutex<Tables>>) -> Persist {
        let (committed, committed_rx) = watch::channel(0);
        let (flushed_tx, flushed) = watch::channel(Flushed::default());
        let flush_now = Arc::new(Notify::new());
        let flusher = Flusher {
            path,
            tables,
            committed: committed_rx,
            flushed: flushed_tx,
            flush_now: flush_now.clone(),
        };
        tokio::spawn(flusher.run());
        Persist {
            committed,
            flushed,
            flush_now,
        }
    }

    async fn run(mut self) {
        loop {
            // Closed once the database is gone; the last commits still land.
            let open = self.committed.changed().await.is_ok();
            if open {
                tokio::select! {
                    _ = tokio::time::sleep(FLUSH_DELAY) => {}
                    _ = self.flush_now.notified() => {}
                }
            }
            let generation = *self.committed.borrow_and_update();
            if generation > self.flushed.borrow().generation {
                self.write(generation).await;
            }
            if !open {
                trace!(path = %self.path.display(), "snapshot flusher stopped");
                return;
            }
        }
    }

    async fn write(&self, generation: u64) {
        let encoded = encode_snapshot(&lock(&self.tables));
        let result = match encoded {
            Ok(bytes) => {
                let path = self.path.clone();
                tokio::task::spawn_blocking(move || write_snapshot(&path, &bytes))
                    .await
                    .unwrap_or_else(|e| Err(StoreError::Flush(e.to_string())))
            }
            Err(e) => Err(e),
        };
        self.flushed.send_modify(|state| match result {
            Ok(()) => {
                trace!(path = %self.path.display(), generation, "snapshot written");
                state.generation = generation;
                state.writes += 1;
                state.error = None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot write failed");
                state.error = Some(e.to_string());
            }
        });
    }
}

/// A unit of work over a fixed set of kinds.
///
/// Reads see the transaction's own uncommitted writes. Dropping a
/// transaction without [`commit`](Self::commit) discards its writes.
#[derive(Debug)]
pub struct Transaction {
    db: Database,
    scope: BTreeSet<EntityKind>,
    mode: TransactionMode,
    writes: WriteSet,
    locks: Vec<OwnedMutexGuard<()>>,
}

impl Transaction {
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn covers(&self, kind: EntityKind) -> bool {
        self.scope.contains(&kind)
    }

    fn check_scope(&self, kind: EntityKind) -> StoreResult<()> {
        if self.covers(kind) {
            Ok(())
        } else {
            Err(StoreError::KindNotInScope(kind))
        }
    }

    fn check_write(&self, kind: EntityKind) -> StoreResult<()> {
        self.check_scope(kind)?;
        match self.mode {
            TransactionMode::ReadWrite => Ok(()),
            TransactionMode::ReadOnly => Err(StoreError::ReadOnly),
        }
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
        self.check_scope(kind)?;
        if let Some(staged) = self.writes.get(&(kind, id.to_string())) {
            return Ok(staged.clone());
        }
        Ok(self.db.read(kind, id))
    }

    /// All records of `kind`, ordered by id.
    pub fn all(&self, kind: EntityKind) -> StoreResult<Vec<Value>> {
        self.check_scope(kind)?;
        let mut table = self.db.read_all(kind);
        for ((staged_kind, id), value) in self.writes.range((kind, String::new())..) {
            if *staged_kind != kind {
                break;
            }
            match value {
                Some(value) => {
                    table.insert(id.clone(), value.clone());
                }
                None => {
                    table.remove(id);
                }
            }
        }
        Ok(table.into_values().collect())
    }

    pub fn put(&mut self, kind: EntityKind, id: impl Into<String>, value: Value) -> StoreResult<()> {
        self.check_write(kind)?;
        self.writes.insert((kind, id.into()), Some(value));
        Ok(())
    }

    /// Stages a delete; returns whether the record existed.
    pub fn delete(&mut self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        self.check_write(kind)?;
        let existed = self.get(kind, id)?.is_some();
        self.writes.insert((kind, id.to_string()), None);
        Ok(existed)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Applies every staged write at once and publishes the changes.
    pub fn commit(self) -> StoreResult<Vec<StoreChange>> {
        let Transaction {
            db, writes, locks, ..
        } = self;
        let changes = if writes.is_empty() {
            Vec::new()
        } else {
            db.apply(writes)?
        };
        drop(locks);
        Ok(changes)
    }
}
