//! Plain key-value engines: records by primary key, no secondary indexes.
//!
//! Three flavors share one implementation: `persistent` snapshots to a JSON
//! file under the configured base directory, `session` and `memory` live
//! and die with the connection. Index scans report `NotImplemented`; the
//! query layer falls back accordingly.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use polydb_common::schema::SchemaDelta;
use polydb_common::{DatabaseSchema, DbError, Key, KeyRange, Result, Value};
use serde::{Deserialize, Serialize};

use super::{
    resolve_primary_key, CursorRow, Driver, Mechanism, ScanPlan, StoreTx, TxClosure, TxMode,
    TxReport,
};

#[derive(Debug, Clone, Default)]
struct KvStore {
    rows: BTreeMap<Key, Value>,
    next_auto: u64,
}

#[derive(Debug, Default)]
struct KvState {
    schema: DatabaseSchema,
    stores: HashMap<String, KvStore>,
}

/// On-disk snapshot layout. Rows are kept as pairs because JSON object
/// keys must be strings.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    schema: DatabaseSchema,
    stores: Vec<StoreSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    name: String,
    next_auto: u64,
    rows: Vec<(Key, Value)>,
}

/// Key-value backend driver, in one of three persistence flavors.
pub struct KvDriver {
    mechanism: Mechanism,
    base_dir: Option<PathBuf>,
    snapshot_path: Mutex<Option<PathBuf>>,
    state: Mutex<KvState>,
    ready: AtomicBool,
}

impl KvDriver {
    pub fn persistent(base_dir: Option<PathBuf>) -> Self {
        Self::with_mechanism(Mechanism::KvPersistent, base_dir)
    }

    pub fn session() -> Self {
        Self::with_mechanism(Mechanism::KvSession, None)
    }

    pub fn memory() -> Self {
        Self::with_mechanism(Mechanism::KvMemory, None)
    }

    fn with_mechanism(mechanism: Mechanism, base_dir: Option<PathBuf>) -> Self {
        KvDriver {
            mechanism,
            base_dir,
            snapshot_path: Mutex::new(None),
            state: Mutex::new(KvState::default()),
            ready: AtomicBool::new(false),
        }
    }

    fn load_snapshot(&self, path: &PathBuf) -> Result<Option<KvState>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&text)
            .map_err(|e| DbError::Internal(format!("corrupt snapshot {path:?}: {e}")))?;
        let mut state = KvState {
            schema: snapshot.schema,
            stores: HashMap::new(),
        };
        for store in snapshot.stores {
            state.stores.insert(
                store.name,
                KvStore {
                    rows: store.rows.into_iter().collect(),
                    next_auto: store.next_auto,
                },
            );
        }
        Ok(Some(state))
    }

    fn flush(&self, state: &KvState) -> Result<()> {
        let path = self.snapshot_path.lock().clone();
        let Some(path) = path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            schema: state.schema.clone(),
            stores: state
                .stores
                .iter()
                .map(|(name, store)| StoreSnapshot {
                    name: name.clone(),
                    next_auto: store.next_auto,
                    rows: store
                        .rows
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                })
                .collect(),
        };
        let text = serde_json::to_string(&snapshot)?;
        std::fs::write(&path, text)?;
        Ok(())
    }
}

impl Driver for KvDriver {
    fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    fn is_supported(&self) -> bool {
        // The persistent flavor needs somewhere to put its snapshot.
        self.mechanism != Mechanism::KvPersistent || self.base_dir.is_some()
    }

    fn connect(&self, name: &str, schema: &DatabaseSchema) -> Result<DatabaseSchema> {
        let mut state = self.state.lock();

        if self.mechanism == Mechanism::KvPersistent {
            let dir = self.base_dir.clone().ok_or_else(|| {
                DbError::Constraint("persistent key-value store requires a base directory".into())
            })?;
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(format!("{name}.json"));
            if let Some(loaded) = self.load_snapshot(&path)? {
                *state = loaded;
            }
            *self.snapshot_path.lock() = Some(path);
        }

        let delta = schema.delta_from(&state.schema);
        if !delta.is_empty() {
            tracing::debug!(
                database = name,
                stores = delta.create_stores.len(),
                "key-value engine applying schema delta"
            );
        }
        state.schema = schema.clone();
        state.stores.retain(|k, _| schema.has_store(k));
        for store in schema.stores() {
            state.stores.entry(store.name.clone()).or_default();
        }
        self.flush(&state)?;
        self.ready.store(true, AtomicOrdering::SeqCst);
        Ok(schema.clone())
    }

    fn transaction(&self, stores: &[String], mode: TxMode, closure: TxClosure) -> TxReport {
        let mut state = self.state.lock();

        let snapshot: HashMap<String, KvStore> = match mode {
            TxMode::VersionChange => state.stores.clone(),
            _ => stores
                .iter()
                .filter_map(|name| state.stores.get(name).map(|s| (name.clone(), s.clone())))
                .collect(),
        };
        let schema_snapshot = state.schema.clone();

        let mut tx = KvTx {
            state: &mut *state,
            mechanism: self.mechanism,
            scope: stores.to_vec(),
            mode,
            aborted: false,
        };
        let result = closure(&mut tx);
        let aborted = tx.aborted;

        if aborted || result.is_err() {
            if mode == TxMode::VersionChange {
                state.stores = snapshot;
            } else {
                for (name, store) in snapshot {
                    state.stores.insert(name, store);
                }
            }
            state.schema = schema_snapshot;
            return match result {
                Err(err) => TxReport::error(err),
                Ok(_) => TxReport::abort(),
            };
        }

        if mode != TxMode::ReadOnly {
            if let Err(err) = self.flush(&state) {
                tracing::error!(error = %err, "failed to flush key-value snapshot");
                return TxReport::error(err);
            }
        }
        TxReport::complete(result.unwrap_or(Value::Null))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::SeqCst)
    }

    fn close(&self) {
        let state = self.state.lock();
        if let Err(err) = self.flush(&state) {
            tracing::error!(error = %err, "failed to flush key-value snapshot on close");
        }
        self.ready.store(false, AtomicOrdering::SeqCst);
    }
}

struct KvTx<'a> {
    state: &'a mut KvState,
    mechanism: Mechanism,
    scope: Vec<String>,
    mode: TxMode,
    aborted: bool,
}

impl KvTx<'_> {
    fn check_scope(&self, store: &str) -> Result<()> {
        if self.mode == TxMode::VersionChange || self.scope.iter().any(|s| s == store) {
            Ok(())
        } else {
            Err(DbError::InvalidOperation(format!(
                "store '{store}' is outside the transaction scope"
            )))
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            TxMode::ReadOnly => Err(DbError::InvalidOperation(
                "write inside a read-only transaction".into(),
            )),
            _ => Ok(()),
        }
    }

    fn store_mut(&mut self, store: &str) -> Result<(&mut KvStore, polydb_common::StoreSchema)> {
        let schema = self
            .state
            .schema
            .store(store)
            .cloned()
            .ok_or_else(|| DbError::Argument(format!("unknown store '{store}'")))?;
        let data = self
            .state
            .stores
            .get_mut(store)
            .ok_or_else(|| DbError::Argument(format!("unknown store '{store}'")))?;
        Ok((data, schema))
    }

    fn store_ref(&self, store: &str) -> Result<&KvStore> {
        self.state
            .stores
            .get(store)
            .ok_or_else(|| DbError::Argument(format!("unknown store '{store}'")))
    }
}

impl StoreTx for KvTx<'_> {
    fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    fn mode(&self) -> TxMode {
        self.mode
    }

    fn schema(&self) -> DatabaseSchema {
        self.state.schema.clone()
    }

    fn put(&mut self, store: &str, record: Value, key: Option<Key>) -> Result<Key> {
        self.check_scope(store)?;
        self.check_writable()?;
        let (data, schema) = self.store_mut(store)?;
        let mut record = record;
        let pk = resolve_primary_key(&schema, &mut record, key, &mut data.next_auto)?;
        data.rows.insert(pk.clone(), record);
        Ok(pk)
    }

    fn add(&mut self, store: &str, record: Value, key: Option<Key>) -> Result<Key> {
        self.check_scope(store)?;
        self.check_writable()?;
        let (data, schema) = self.store_mut(store)?;
        let mut record = record;
        let pk = resolve_primary_key(&schema, &mut record, key, &mut data.next_auto)?;
        if data.rows.contains_key(&pk) {
            return Err(DbError::Constraint(format!(
                "key {pk} already exists in store '{store}'"
            )));
        }
        data.rows.insert(pk.clone(), record);
        Ok(pk)
    }

    fn get(&mut self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.check_scope(store)?;
        Ok(self.store_ref(store)?.rows.get(key).cloned())
    }

    fn delete(&mut self, store: &str, key: &Key) -> Result<u64> {
        self.check_scope(store)?;
        self.check_writable()?;
        let (data, _) = self.store_mut(store)?;
        Ok(data.rows.remove(key).map(|_| 1).unwrap_or(0))
    }

    fn delete_range(&mut self, store: &str, range: &KeyRange) -> Result<u64> {
        self.check_scope(store)?;
        self.check_writable()?;
        let (data, _) = self.store_mut(store)?;
        let before = data.rows.len();
        data.rows.retain(|k, _| !range.contains(k));
        Ok((before - data.rows.len()) as u64)
    }

    fn clear_store(&mut self, store: &str) -> Result<()> {
        self.check_scope(store)?;
        self.check_writable()?;
        let (data, _) = self.store_mut(store)?;
        data.rows.clear();
        Ok(())
    }

    fn count(&mut self, store: &str, range: Option<&KeyRange>) -> Result<u64> {
        self.check_scope(store)?;
        let data = self.store_ref(store)?;
        Ok(match range {
            Some(range) => data.rows.keys().filter(|k| range.contains(k)).count() as u64,
            None => data.rows.len() as u64,
        })
    }

    fn scan(&mut self, plan: &ScanPlan) -> Result<Vec<CursorRow>> {
        self.check_scope(&plan.store)?;
        if plan.index.is_some() {
            return Err(DbError::NotImplemented(format!(
                "secondary index scans are not available on the {} mechanism",
                self.mechanism.id()
            )));
        }
        let data = self.store_ref(&plan.store)?;
        let range = plan.range.clone().unwrap_or_default();
        let mut rows: Vec<CursorRow> = data
            .rows
            .iter()
            .filter(|(pk, _)| range.contains(pk))
            .map(|(pk, value)| CursorRow {
                primary_key: pk.clone(),
                effective_key: pk.clone(),
                value: (!plan.key_only).then(|| value.clone()),
            })
            .collect();
        if plan.direction.is_reverse() {
            rows.reverse();
        }
        Ok(rows)
    }

    fn sql(&mut self) -> Option<&mut dyn super::SqlExecutor> {
        None
    }

    fn apply_delta(&mut self, delta: &SchemaDelta) -> Result<()> {
        if self.mode != TxMode::VersionChange {
            return Err(DbError::InvalidOperation(
                "schema changes require a version-change transaction".into(),
            ));
        }
        // Key-value stores carry index declarations in the schema only;
        // there is nothing to materialize for them.
        for store in &delta.create_stores {
            self.state.stores.entry(store.name.clone()).or_default();
            self.state.schema.upgrade_store(store.clone());
        }
        for (store_name, ix) in &delta.create_indexes {
            if let Some(mut schema) = self.state.schema.store(store_name).cloned() {
                schema.indexes.retain(|existing| existing.name != ix.name);
                schema.indexes.push(ix.clone());
                self.state.schema.upgrade_store(schema);
            }
        }
        for (store_name, ix_name) in &delta.drop_indexes {
            if let Some(mut schema) = self.state.schema.store(store_name).cloned() {
                schema.indexes.retain(|existing| &existing.name != ix_name);
                self.state.schema.upgrade_store(schema);
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }
}
