//! Backend driver contract and the in-tree reference engines.
//!
//! The rest of the layer only sees [`Driver`] and [`StoreTx`]: connect with
//! a schema, run closures inside scoped transactions, compare keys. Which
//! concrete engine sits behind those traits is decided once, at connection
//! time, by the connection manager.

use std::cmp::Ordering;
use std::sync::Arc;

use polydb_common::schema::SchemaDelta;
use polydb_common::{DatabaseSchema, DbError, Key, KeyRange, Result, StoreSchema, Value};

use crate::config::StorageOptions;

pub mod kv;
pub mod native;
pub mod sql;

pub use sql::{SqlExecutor, SqlParam, SqlRow, SqlValue};

// Identifiers

/// The backend mechanisms a connection can select among, in default
/// preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// Native object-store engine with secondary indexes.
    NativeIndexed,
    /// Relational engine driven through generated SQL.
    RelationalSql,
    /// Key-value store persisted to disk.
    KvPersistent,
    /// Key-value store scoped to the connection's session.
    KvSession,
    /// Ephemeral in-memory key-value store.
    KvMemory,
}

impl Mechanism {
    pub const DEFAULT_ORDER: [Mechanism; 5] = [
        Mechanism::NativeIndexed,
        Mechanism::RelationalSql,
        Mechanism::KvPersistent,
        Mechanism::KvSession,
        Mechanism::KvMemory,
    ];

    /// Stable identifier, reported by `Storage::mechanism()`.
    pub fn id(&self) -> &'static str {
        match self {
            Mechanism::NativeIndexed => "indexed",
            Mechanism::RelationalSql => "sql",
            Mechanism::KvPersistent => "kv-persistent",
            Mechanism::KvSession => "kv-session",
            Mechanism::KvMemory => "kv-memory",
        }
    }
}

/// Transaction mode. `VersionChange` is exclusive against every other
/// transaction of the connection and is the only mode that may mutate the
/// schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

/// How a transaction finished. Reported exactly once per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Complete,
    Error,
    Abort,
}

/// Iteration order. The `Unique` variants suppress duplicate effective
/// keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl Direction {
    pub fn is_reverse(&self) -> bool {
        matches!(self, Direction::Prev | Direction::PrevUnique)
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, Direction::NextUnique | Direction::PrevUnique)
    }

    pub fn id(&self) -> &'static str {
        match self {
            Direction::Next => "next",
            Direction::NextUnique => "nextUnique",
            Direction::Prev => "prev",
            Direction::PrevUnique => "prevUnique",
        }
    }
}

// Transaction surface

/// One positioned row of an index or store scan.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRow {
    pub primary_key: Key,
    /// The key the scan is ordered by: the index key when scanning an
    /// index, the primary key otherwise.
    pub effective_key: Key,
    /// Absent on key-only scans.
    pub value: Option<Value>,
}

/// A materializable range scan over one store, optionally through an index.
#[derive(Debug, Clone, Default)]
pub struct ScanPlan {
    pub store: String,
    pub index: Option<String>,
    pub range: Option<KeyRange>,
    pub direction: Direction,
    pub key_only: bool,
}

impl ScanPlan {
    pub fn store(store: impl Into<String>) -> Self {
        ScanPlan {
            store: store.into(),
            ..ScanPlan::default()
        }
    }
}

/// Operations available to a transaction closure.
///
/// Implementations roll the scoped stores back when the closure returns an
/// error or requests an abort.
pub trait StoreTx {
    fn mechanism(&self) -> Mechanism;
    fn mode(&self) -> TxMode;
    fn schema(&self) -> DatabaseSchema;

    /// Upsert a record. Resolves the primary key from the explicit key, the
    /// store's key path, or the auto-increment counter.
    fn put(&mut self, store: &str, record: Value, key: Option<Key>) -> Result<Key>;

    /// Insert-only variant; an existing primary key is a constraint error.
    fn add(&mut self, store: &str, record: Value, key: Option<Key>) -> Result<Key>;

    fn get(&mut self, store: &str, key: &Key) -> Result<Option<Value>>;

    /// Delete one record; returns the number removed (0 or 1).
    fn delete(&mut self, store: &str, key: &Key) -> Result<u64>;

    /// Delete every record in the range; returns the number removed.
    fn delete_range(&mut self, store: &str, range: &KeyRange) -> Result<u64>;

    fn clear_store(&mut self, store: &str) -> Result<()>;

    fn count(&mut self, store: &str, range: Option<&KeyRange>) -> Result<u64>;

    /// Materialize an ordered scan. Duplicate effective keys are retained;
    /// unique-direction suppression happens in the consumer.
    fn scan(&mut self, plan: &ScanPlan) -> Result<Vec<CursorRow>>;

    /// The SQL surface, on relational backends only.
    fn sql(&mut self) -> Option<&mut dyn SqlExecutor>;

    /// Apply a schema delta. Only legal in a version-change transaction.
    fn apply_delta(&mut self, delta: &SchemaDelta) -> Result<()>;

    /// Request rollback without an error.
    fn abort(&mut self);
    fn is_aborted(&self) -> bool;
}

pub type TxClosure = Box<dyn FnOnce(&mut dyn StoreTx) -> Result<Value> + Send>;

/// Outcome of a driver transaction, delivered exactly once.
#[derive(Debug)]
pub struct TxReport {
    pub kind: TxKind,
    pub result: Result<Value>,
}

impl TxReport {
    pub fn complete(value: Value) -> Self {
        TxReport {
            kind: TxKind::Complete,
            result: Ok(value),
        }
    }

    pub fn error(err: DbError) -> Self {
        TxReport {
            kind: TxKind::Error,
            result: Err(err),
        }
    }

    pub fn abort() -> Self {
        TxReport {
            kind: TxKind::Abort,
            result: Ok(Value::Null),
        }
    }
}

// Driver contract

/// A storage backend as the connection manager sees it.
pub trait Driver: Send + Sync {
    fn mechanism(&self) -> Mechanism;

    /// Whether this mechanism is usable in the current environment.
    fn is_supported(&self) -> bool {
        true
    }

    /// Open or create the database and reconcile the persisted schema with
    /// the provided one, upgrading if they differ on any store. Returns the
    /// reconciled schema; the driver is ready afterwards.
    fn connect(&self, name: &str, schema: &DatabaseSchema) -> Result<DatabaseSchema>;

    /// Run a closure inside a backend transaction scoped to `stores`.
    fn transaction(&self, stores: &[String], mode: TxMode, closure: TxClosure) -> TxReport;

    /// Key comparison, consistent with the layer-wide key order.
    fn cmp(&self, a: &Key, b: &Key) -> Ordering {
        a.cmp(b)
    }

    fn is_ready(&self) -> bool;

    fn close(&self);
}

/// Instantiate the engine behind a mechanism identifier.
pub fn create_driver(mechanism: Mechanism, options: &StorageOptions) -> Arc<dyn Driver> {
    match mechanism {
        Mechanism::NativeIndexed => Arc::new(native::NativeDriver::new()),
        Mechanism::RelationalSql => Arc::new(sql::SqlDriver::new()),
        Mechanism::KvPersistent => Arc::new(kv::KvDriver::persistent(options.base_dir.clone())),
        Mechanism::KvSession => Arc::new(kv::KvDriver::session()),
        Mechanism::KvMemory => Arc::new(kv::KvDriver::memory()),
    }
}

// Shared write-path helpers

/// Resolve the primary key for a write, per the store's declaration.
///
/// In-line key stores extract from the record (injecting a generated key
/// when auto-increment); out-of-line stores take the explicit key or a
/// generated one. Supplying an explicit key to an in-line store is an
/// argument error, as is a write that resolves to no key at all.
pub(crate) fn resolve_primary_key(
    store: &StoreSchema,
    record: &mut Value,
    explicit: Option<Key>,
    next_auto: &mut u64,
) -> Result<Key> {
    match &store.key_path {
        Some(path) => {
            if explicit.is_some() {
                return Err(DbError::Argument(format!(
                    "store '{}' uses an in-line key path, out-of-line key not allowed",
                    store.name
                )));
            }
            match path.extract(record)? {
                Some(key) => Ok(key),
                None if store.auto_increment => {
                    let key = generate_key(next_auto);
                    path.inject(record, &key)?;
                    Ok(key)
                }
                None => Err(DbError::Argument(format!(
                    "record has no key at path for store '{}'",
                    store.name
                ))),
            }
        }
        None => match explicit {
            Some(key) => Ok(key),
            None if store.auto_increment => Ok(generate_key(next_auto)),
            None => Err(DbError::Argument(format!(
                "store '{}' requires an out-of-line key",
                store.name
            ))),
        },
    }
}

fn generate_key(next_auto: &mut u64) -> Key {
    *next_auto += 1;
    Key::Number(*next_auto as f64)
}

/// Extract the index entries a record contributes to one index.
///
/// A multi-entry index fans an array value out to one entry per element;
/// a record with no value at the index path contributes nothing.
pub(crate) fn index_keys(index: &polydb_common::IndexSchema, record: &Value) -> Result<Vec<Key>> {
    let path = index.effective_key_path();
    match &path {
        polydb_common::KeyPath::Single(p) => match record.get_path(p) {
            Some(Value::Array(items)) if index.multi_entry => {
                items.iter().map(Key::from_value).collect()
            }
            Some(v) => Ok(vec![Key::from_value(v)?]),
            None => Ok(vec![]),
        },
        polydb_common::KeyPath::Tuple(_) => Ok(path.extract(record)?.into_iter().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polydb_common::schema::{IndexSchema, KeyType};
    use polydb_common::record;

    #[test]
    fn inline_key_store_rejects_explicit_keys() {
        let store = StoreSchema::new("st").with_key_path("id", KeyType::Number);
        let mut rec = record! { "id" => 3i64 };
        let mut auto = 0;

        let err = resolve_primary_key(&store, &mut rec, Some(Key::Number(4.0)), &mut auto)
            .unwrap_err();
        assert_eq!(err.kind(), "argument_error");

        let key = resolve_primary_key(&store, &mut rec, None, &mut auto).unwrap();
        assert_eq!(key, Key::Number(3.0));
    }

    #[test]
    fn auto_increment_injects_generated_keys() {
        let store = StoreSchema::new("st")
            .with_key_path("id", KeyType::Number);
        let mut store = store;
        store.auto_increment = true;

        let mut rec = record! { "v" => "a" };
        let mut auto = 0;
        let key = resolve_primary_key(&store, &mut rec, None, &mut auto).unwrap();
        assert_eq!(key, Key::Number(1.0));
        assert_eq!(rec.get_path("id"), Some(&Value::Number(1.0)));

        let mut rec2 = record! { "v" => "b" };
        let key2 = resolve_primary_key(&store, &mut rec2, None, &mut auto).unwrap();
        assert_eq!(key2, Key::Number(2.0));
    }

    #[test]
    fn multi_entry_index_fans_out_arrays() {
        let index = IndexSchema::new("tags", KeyType::Text).multi_entry();
        let rec = record! {
            "tags" => polydb_common::Value::Array(vec![
                Value::Text("a".into()),
                Value::Text("b".into()),
            ])
        };
        let keys = index_keys(&index, &rec).unwrap();
        assert_eq!(keys, vec![Key::Text("a".into()), Key::Text("b".into())]);

        let empty = record! { "other" => 1i64 };
        assert!(index_keys(&index, &empty).unwrap().is_empty());
    }
}
