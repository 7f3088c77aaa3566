//! The native object-store engine.
//!
//! Stores are ordered maps keyed by primary key; every index is a second
//! ordered map keyed by `(index key, primary key)`, which makes range scans
//! in either direction a plain ordered traversal. Consumes scan plans
//! directly, with no SQL in between.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use polydb_common::schema::SchemaDelta;
use polydb_common::{DatabaseSchema, DbError, Key, KeyRange, Result, StoreSchema, Value};

use super::{
    index_keys, resolve_primary_key, CursorRow, Driver, Mechanism, ScanPlan, StoreTx, TxClosure,
    TxMode, TxReport,
};

/// Sentinel that sorts at-or-before every real key. Finite, so it is a
/// legal key itself; used only as a scan seed, never stored.
fn floor_key() -> Key {
    Key::Number(f64::MIN)
}

#[derive(Debug, Clone, Default)]
struct StoreData {
    rows: BTreeMap<Key, Value>,
    /// One ordered map per index: (index key, primary key) -> ().
    indexes: HashMap<String, BTreeMap<(Key, Key), ()>>,
    next_auto: u64,
}

impl StoreData {
    fn for_schema(schema: &StoreSchema) -> Self {
        let mut data = StoreData::default();
        for ix in &schema.indexes {
            data.indexes.insert(ix.name.clone(), BTreeMap::new());
        }
        data
    }

    /// Primary keys currently holding the given key in the named index.
    fn index_holders<'a>(
        &'a self,
        index: &str,
        key: &'a Key,
    ) -> impl Iterator<Item = &'a Key> + 'a {
        self.indexes
            .get(index)
            .into_iter()
            .flat_map(move |map| {
                map.range((key.clone(), floor_key())..)
                    .take_while(move |((ix, _), _)| ix == key)
                    .map(|((_, pk), _)| pk)
            })
    }

    fn unlink_indexes(&mut self, schema: &StoreSchema, pk: &Key, record: &Value) -> Result<()> {
        for ix in &schema.indexes {
            if let Some(map) = self.indexes.get_mut(&ix.name) {
                for key in index_keys(ix, record)? {
                    map.remove(&(key, pk.clone()));
                }
            }
        }
        Ok(())
    }

    fn link_indexes(&mut self, schema: &StoreSchema, pk: &Key, record: &Value) -> Result<()> {
        for ix in &schema.indexes {
            let keys = index_keys(ix, record)?;
            if let Some(map) = self.indexes.get_mut(&ix.name) {
                for key in keys {
                    map.insert((key, pk.clone()), ());
                }
            }
        }
        Ok(())
    }

    fn write(
        &mut self,
        schema: &StoreSchema,
        record: Value,
        explicit: Option<Key>,
        insert_only: bool,
    ) -> Result<Key> {
        let mut record = record;
        let pk = resolve_primary_key(schema, &mut record, explicit, &mut self.next_auto)?;

        if insert_only && self.rows.contains_key(&pk) {
            return Err(DbError::Constraint(format!(
                "key {pk} already exists in store '{}'",
                schema.name
            )));
        }

        // Unique indexes: no other primary key may hold the same index key.
        for ix in schema.indexes.iter().filter(|ix| ix.unique) {
            for key in index_keys(ix, &record)? {
                if self.index_holders(&ix.name, &key).any(|holder| holder != &pk) {
                    return Err(DbError::Constraint(format!(
                        "unique index '{}' already holds {key}",
                        ix.name
                    )));
                }
            }
        }

        if let Some(old) = self.rows.get(&pk).cloned() {
            self.unlink_indexes(schema, &pk, &old)?;
        }
        self.link_indexes(schema, &pk, &record)?;
        self.rows.insert(pk.clone(), record);
        Ok(pk)
    }

    fn remove(&mut self, schema: &StoreSchema, pk: &Key) -> Result<u64> {
        match self.rows.remove(pk) {
            Some(old) => {
                self.unlink_indexes(schema, pk, &old)?;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    schema: DatabaseSchema,
    stores: HashMap<String, StoreData>,
}

impl EngineState {
    fn apply_delta(&mut self, delta: &SchemaDelta) -> Result<()> {
        for store in &delta.create_stores {
            self.stores
                .entry(store.name.clone())
                .or_insert_with(|| StoreData::for_schema(store));
            self.schema.upgrade_store(store.clone());
        }
        for (store_name, ix) in &delta.create_indexes {
            let schema = self
                .schema
                .store(store_name)
                .cloned()
                .ok_or_else(|| DbError::Argument(format!("unknown store '{store_name}'")))?;
            let data = self
                .stores
                .get_mut(store_name)
                .ok_or_else(|| DbError::Internal(format!("no data for store '{store_name}'")))?;

            let mut map = BTreeMap::new();
            for (pk, record) in &data.rows {
                for key in index_keys(ix, record)? {
                    if ix.unique && map.keys().any(|(k, _): &(Key, Key)| k == &key) {
                        return Err(DbError::Constraint(format!(
                            "cannot build unique index '{}': duplicate key {key}",
                            ix.name
                        )));
                    }
                    map.insert((key, pk.clone()), ());
                }
            }
            data.indexes.insert(ix.name.clone(), map);

            let mut updated = schema;
            updated.indexes.retain(|existing| existing.name != ix.name);
            updated.indexes.push(ix.clone());
            self.schema.upgrade_store(updated);
        }
        for (store_name, ix_name) in &delta.drop_indexes {
            if let Some(data) = self.stores.get_mut(store_name) {
                data.indexes.remove(ix_name);
            }
            if let Some(schema) = self.schema.store(store_name).cloned() {
                let mut updated = schema;
                updated.indexes.retain(|existing| &existing.name != ix_name);
                self.schema.upgrade_store(updated);
            }
        }
        Ok(())
    }
}

/// In-memory native indexed engine.
pub struct NativeDriver {
    state: Mutex<EngineState>,
    ready: AtomicBool,
}

impl NativeDriver {
    pub fn new() -> Self {
        NativeDriver {
            state: Mutex::new(EngineState::default()),
            ready: AtomicBool::new(false),
        }
    }
}

impl Default for NativeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for NativeDriver {
    fn mechanism(&self) -> Mechanism {
        Mechanism::NativeIndexed
    }

    fn connect(&self, name: &str, schema: &DatabaseSchema) -> Result<DatabaseSchema> {
        let mut state = self.state.lock();
        let delta = schema.delta_from(&state.schema);
        if !delta.is_empty() {
            tracing::debug!(
                database = name,
                stores = delta.create_stores.len(),
                "native engine applying schema delta"
            );
        }
        state.schema = schema.clone();
        state.stores.retain(|k, _| schema.has_store(k));
        for store in schema.stores() {
            state
                .stores
                .entry(store.name.clone())
                .or_insert_with(|| StoreData::for_schema(store));
        }
        self.ready.store(true, AtomicOrdering::SeqCst);
        Ok(schema.clone())
    }

    fn transaction(&self, stores: &[String], mode: TxMode, closure: TxClosure) -> TxReport {
        let mut state = self.state.lock();

        // Snapshot for rollback: scoped stores, or everything for a
        // version change (which may touch the schema itself).
        let snapshot: HashMap<String, StoreData> = match mode {
            TxMode::VersionChange => state.stores.clone(),
            _ => stores
                .iter()
                .filter_map(|name| state.stores.get(name).map(|d| (name.clone(), d.clone())))
                .collect(),
        };
        let schema_snapshot = state.schema.clone();

        let mut tx = NativeTx {
            state: &mut *state,
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
                for (name, data) in snapshot {
                    state.stores.insert(name, data);
                }
            }
            state.schema = schema_snapshot;
            return match result {
                Err(err) => TxReport::error(err),
                Ok(_) => TxReport::abort(),
            };
        }
        TxReport::complete(result.unwrap_or(Value::Null))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::SeqCst)
    }

    fn close(&self) {
        self.ready.store(false, AtomicOrdering::SeqCst);
    }
}

struct NativeTx<'a> {
    state: &'a mut EngineState,
    scope: Vec<String>,
    mode: TxMode,
    aborted: bool,
}

impl NativeTx<'_> {
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

    fn store_schema(&self, store: &str) -> Result<StoreSchema> {
        self.state
            .schema
            .store(store)
            .cloned()
            .ok_or_else(|| DbError::Argument(format!("unknown store '{store}'")))
    }

    fn data(&self, store: &str) -> Result<&StoreData> {
        self.state
            .stores
            .get(store)
            .ok_or_else(|| DbError::Argument(format!("unknown store '{store}'")))
    }

    fn data_mut(&mut self, store: &str) -> Result<&mut StoreData> {
        self.state
            .stores
            .get_mut(store)
            .ok_or_else(|| DbError::Argument(format!("unknown store '{store}'")))
    }
}

impl StoreTx for NativeTx<'_> {
    fn mechanism(&self) -> Mechanism {
        Mechanism::NativeIndexed
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
        let schema = self.store_schema(store)?;
        self.data_mut(store)?.write(&schema, record, key, false)
    }

    fn add(&mut self, store: &str, record: Value, key: Option<Key>) -> Result<Key> {
        self.check_scope(store)?;
        self.check_writable()?;
        let schema = self.store_schema(store)?;
        self.data_mut(store)?.write(&schema, record, key, true)
    }

    fn get(&mut self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.check_scope(store)?;
        Ok(self.data(store)?.rows.get(key).cloned())
    }

    fn delete(&mut self, store: &str, key: &Key) -> Result<u64> {
        self.check_scope(store)?;
        self.check_writable()?;
        let schema = self.store_schema(store)?;
        self.data_mut(store)?.remove(&schema, key)
    }

    fn delete_range(&mut self, store: &str, range: &KeyRange) -> Result<u64> {
        self.check_scope(store)?;
        self.check_writable()?;
        let schema = self.store_schema(store)?;
        let data = self.data_mut(store)?;
        let doomed: Vec<Key> = data
            .rows
            .keys()
            .filter(|k| range.contains(k))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in doomed {
            removed += data.remove(&schema, &key)?;
        }
        Ok(removed)
    }

    fn clear_store(&mut self, store: &str) -> Result<()> {
        self.check_scope(store)?;
        self.check_writable()?;
        let schema = self.store_schema(store)?;
        let data = self.data_mut(store)?;
        *data = StoreData {
            next_auto: data.next_auto,
            ..StoreData::for_schema(&schema)
        };
        Ok(())
    }

    fn count(&mut self, store: &str, range: Option<&KeyRange>) -> Result<u64> {
        self.check_scope(store)?;
        let data = self.data(store)?;
        Ok(match range {
            Some(range) => data.rows.keys().filter(|k| range.contains(k)).count() as u64,
            None => data.rows.len() as u64,
        })
    }

    fn scan(&mut self, plan: &ScanPlan) -> Result<Vec<CursorRow>> {
        self.check_scope(&plan.store)?;
        let data = self.data(&plan.store)?;
        let range = plan.range.clone().unwrap_or_default();

        let mut rows: Vec<CursorRow> = match &plan.index {
            None => data
                .rows
                .iter()
                .filter(|(pk, _)| range.contains(pk))
                .map(|(pk, value)| CursorRow {
                    primary_key: pk.clone(),
                    effective_key: pk.clone(),
                    value: (!plan.key_only).then(|| value.clone()),
                })
                .collect(),
            Some(index) => {
                let schema = self.store_schema(&plan.store)?;
                if schema.index(index).is_none() {
                    return Err(DbError::Argument(format!(
                        "store '{}' has no index '{index}'",
                        plan.store
                    )));
                }
                let map = data.indexes.get(index).ok_or_else(|| {
                    DbError::Internal(format!("missing index map '{index}'"))
                })?;
                map.iter()
                    .filter(|((ix, _), _)| range.contains(ix))
                    .map(|((ix, pk), _)| CursorRow {
                        primary_key: pk.clone(),
                        effective_key: ix.clone(),
                        value: (!plan.key_only)
                            .then(|| data.rows.get(pk).cloned())
                            .flatten(),
                    })
                    .collect()
            }
        };

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
        self.state.apply_delta(delta)
    }

    fn abort(&mut self) {
        self.aborted = true;
    }

    fn is_aborted(&self) -> bool {
        self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::super::TxKind;
    use super::*;
    use polydb_common::record;
    use polydb_common::schema::{IndexSchema, KeyType};

    fn driver() -> NativeDriver {
        let schema = DatabaseSchema::fixed(vec![StoreSchema::new("st")
            .with_key_path("id", KeyType::Number)
            .with_index(IndexSchema::new("k", KeyType::Text))
            .with_index(IndexSchema::new("tag", KeyType::Text).unique())]);
        let driver = NativeDriver::new();
        driver.connect("t", &schema).unwrap();
        driver
    }

    fn run(
        driver: &NativeDriver,
        mode: TxMode,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<Value> + Send + 'static,
    ) -> TxReport {
        driver.transaction(&["st".to_string()], mode, Box::new(f))
    }

    #[test]
    fn put_then_get_round_trips() {
        let driver = driver();
        let report = run(&driver, TxMode::ReadWrite, |tx| {
            let rec = record! { "id" => 7i64, "k" => "a", "tag" => "t1" };
            tx.put("st", rec.clone(), None)?;
            Ok(tx.get("st", &Key::Number(7.0))?.unwrap())
        });
        assert_eq!(report.kind, TxKind::Complete);
        let value = report.result.unwrap();
        assert_eq!(value.get_path("k"), Some(&Value::Text("a".into())));
    }

    #[test]
    fn add_collision_rolls_back_nothing_else() {
        let driver = driver();
        run(&driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 7i64, "k" => "a", "tag" => "t1" }, None)?;
            Ok(Value::Null)
        });
        let report = run(&driver, TxMode::ReadWrite, |tx| {
            tx.add("st", record! { "id" => 7i64, "k" => "b", "tag" => "t2" }, None)?;
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Error);

        let check = run(&driver, TxMode::ReadOnly, |tx| {
            Ok(tx.get("st", &Key::Number(7.0))?.unwrap())
        });
        assert_eq!(
            check.result.unwrap().get_path("k"),
            Some(&Value::Text("a".into()))
        );
    }

    #[test]
    fn failed_transaction_restores_prior_state() {
        let driver = driver();
        run(&driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 1i64, "k" => "x", "tag" => "t1" }, None)?;
            Ok(Value::Null)
        });
        let report = run(&driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 2i64, "k" => "y", "tag" => "t2" }, None)?;
            Err(DbError::Internal("boom".into()))
        });
        assert_eq!(report.kind, TxKind::Error);

        let count = run(&driver, TxMode::ReadOnly, |tx| {
            Ok(Value::Number(tx.count("st", None)? as f64))
        });
        assert_eq!(count.result.unwrap(), Value::Number(1.0));
    }

    #[test]
    fn unique_index_rejects_second_holder() {
        let driver = driver();
        run(&driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 1i64, "k" => "a", "tag" => "same" }, None)?;
            Ok(Value::Null)
        });
        let report = run(&driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 2i64, "k" => "b", "tag" => "same" }, None)?;
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Error);
        assert_eq!(report.result.unwrap_err().kind(), "constraint_error");
    }

    #[test]
    fn index_scan_orders_by_index_then_primary_key() {
        let driver = driver();
        run(&driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 2i64, "k" => "a", "tag" => "t2" }, None)?;
            tx.put("st", record! { "id" => 1i64, "k" => "a", "tag" => "t1" }, None)?;
            tx.put("st", record! { "id" => 3i64, "k" => "b", "tag" => "t3" }, None)?;
            Ok(Value::Null)
        });
        let report = run(&driver, TxMode::ReadOnly, |tx| {
            let rows = tx.scan(&ScanPlan {
                store: "st".into(),
                index: Some("k".into()),
                ..ScanPlan::default()
            })?;
            let keys: Vec<String> = rows
                .iter()
                .map(|r| format!("{}:{}", r.effective_key, r.primary_key))
                .collect();
            Ok(Value::Text(keys.join(",")))
        });
        assert_eq!(
            report.result.unwrap(),
            Value::Text("\"a\":1,\"a\":2,\"b\":3".into())
        );
    }

    #[test]
    fn range_scan_respects_open_bounds() {
        let driver = driver();
        run(&driver, TxMode::ReadWrite, |tx| {
            for (id, k) in [(1, "l"), (2, "m"), (3, "p"), (4, "t"), (5, "u")] {
                tx.put(
                    "st",
                    record! { "id" => id as i64, "k" => k, "tag" => k },
                    None,
                )?;
            }
            Ok(Value::Null)
        });
        let report = run(&driver, TxMode::ReadOnly, |tx| {
            let rows = tx.scan(&ScanPlan {
                store: "st".into(),
                index: Some("k".into()),
                range: Some(KeyRange::bound("m".into(), "t".into(), false, true)),
                ..ScanPlan::default()
            })?;
            let keys: Vec<String> = rows.iter().map(|r| r.effective_key.to_string()).collect();
            Ok(Value::Text(keys.join(",")))
        });
        assert_eq!(report.result.unwrap(), Value::Text("\"m\",\"p\"".into()));
    }

    #[test]
    fn version_change_builds_index_over_existing_rows() {
        let driver = driver();
        run(&driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 1i64, "k" => "a", "tag" => "t1", "extra" => 5i64 }, None)?;
            Ok(Value::Null)
        });
        let report = run(&driver, TxMode::VersionChange, |tx| {
            let delta = SchemaDelta {
                create_indexes: vec![(
                    "st".into(),
                    IndexSchema::new("extra", KeyType::Number),
                )],
                ..SchemaDelta::default()
            };
            tx.apply_delta(&delta)?;
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Complete);

        let scan = run(&driver, TxMode::ReadOnly, |tx| {
            let rows = tx.scan(&ScanPlan {
                store: "st".into(),
                index: Some("extra".into()),
                ..ScanPlan::default()
            })?;
            Ok(Value::Number(rows.len() as f64))
        });
        assert_eq!(scan.result.unwrap(), Value::Number(1.0));
    }
}
