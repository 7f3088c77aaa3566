//! Store, index and database schemas.
//!
//! A database schema is the set of declared stores plus an editability mode.
//! Schemas serialize to a stable JSON form (key paths as a string or an
//! array of strings, types as lowercase names) and two schemas are
//! *similar* when they agree on every declared field; similarity is what
//! decides whether a connection needs a version-change transaction.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::value::{Key, Value};
use crate::{DbError, Result};

// Key paths and key types

/// A path designating where a key lives inside a record: a single dotted
/// path, or a tuple of paths for composite keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Tuple(Vec<String>),
}

impl KeyPath {
    /// Extract the key this path designates from a record.
    ///
    /// Returns `Ok(None)` when the record has no value at the path; a tuple
    /// path yields `None` unless every component is present.
    pub fn extract(&self, record: &Value) -> Result<Option<Key>> {
        match self {
            KeyPath::Single(path) => match record.get_path(path) {
                Some(v) => Key::from_value(v).map(Some),
                None => Ok(None),
            },
            KeyPath::Tuple(paths) => {
                let mut parts = Vec::with_capacity(paths.len());
                for path in paths {
                    match record.get_path(path) {
                        Some(v) => parts.push(Key::from_value(v)?),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Key::Tuple(parts)))
            }
        }
    }

    /// Write a key back into a record at this path.
    pub fn inject(&self, record: &mut Value, key: &Key) -> Result<()> {
        match (self, key) {
            (KeyPath::Single(path), key) => record.set_path(path, Value::from(key.clone())),
            (KeyPath::Tuple(paths), Key::Tuple(parts)) if paths.len() == parts.len() => {
                for (path, part) in paths.iter().zip(parts) {
                    record.set_path(path, Value::from(part.clone()))?;
                }
                Ok(())
            }
            (KeyPath::Tuple(_), other) => Err(DbError::Argument(format!(
                "tuple key path requires a tuple key, got {other}"
            ))),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(s: &str) -> Self {
        KeyPath::Single(s.to_string())
    }
}

/// Declared type of a primary or index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "KeyTypeRepr", into = "KeyTypeRepr")]
pub enum KeyType {
    Number,
    Date,
    Text,
    Tuple(Vec<KeyType>),
}

impl Default for KeyType {
    fn default() -> Self {
        KeyType::Text
    }
}

/// JSON shape of a key type: a lowercase name or an array of them.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum KeyTypeRepr {
    Name(String),
    Tuple(Vec<KeyTypeRepr>),
}

impl TryFrom<KeyTypeRepr> for KeyType {
    type Error = DbError;

    fn try_from(repr: KeyTypeRepr) -> Result<Self> {
        match repr {
            KeyTypeRepr::Name(name) => match name.as_str() {
                "number" => Ok(KeyType::Number),
                "date" => Ok(KeyType::Date),
                "text" | "string" => Ok(KeyType::Text),
                other => Err(DbError::Argument(format!("unknown key type '{other}'"))),
            },
            KeyTypeRepr::Tuple(parts) => Ok(KeyType::Tuple(
                parts.into_iter().map(KeyType::try_from).collect::<Result<_>>()?,
            )),
        }
    }
}

impl From<KeyType> for KeyTypeRepr {
    fn from(kt: KeyType) -> Self {
        match kt {
            KeyType::Number => KeyTypeRepr::Name("number".into()),
            KeyType::Date => KeyTypeRepr::Name("date".into()),
            KeyType::Text => KeyTypeRepr::Name("text".into()),
            KeyType::Tuple(parts) => {
                KeyTypeRepr::Tuple(parts.into_iter().map(KeyTypeRepr::from).collect())
            }
        }
    }
}

// Index schema

/// A secondary ordering over a store's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub name: String,
    /// Path of the indexed field; defaults to the index name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,
    #[serde(rename = "type", default)]
    pub key_type: KeyType,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            key_type,
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// The effective key path: the declared one, or the index name.
    pub fn effective_key_path(&self) -> KeyPath {
        self.key_path
            .clone()
            .unwrap_or_else(|| KeyPath::Single(self.name.clone()))
    }

    /// Whether this index covers the given record field.
    pub fn covers_field(&self, field: &str) -> bool {
        match &self.key_path {
            Some(KeyPath::Single(path)) => path == field,
            Some(KeyPath::Tuple(paths)) => paths.first().is_some_and(|p| p == field),
            None => self.name == field,
        }
    }
}

// Store schema

/// A named collection of records keyed by a primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    pub name: String,
    /// In-record location of the primary key; out-of-line keys when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,
    #[serde(rename = "type", default)]
    pub key_type: KeyType,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            key_type: KeyType::default(),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn with_key_path(mut self, key_path: impl Into<KeyPath>, key_type: KeyType) -> Self {
        self.key_path = Some(key_path.into());
        self.key_type = key_type;
        self
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|ix| ix.name == name)
    }

    /// Find the index covering a record field, if any.
    pub fn index_for_field(&self, field: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|ix| ix.covers_field(field))
    }

    pub fn has_index(&self, field: &str) -> bool {
        self.index_for_field(field).is_some()
    }

    /// Extract the in-line primary key from a record.
    ///
    /// `Ok(None)` when the store uses out-of-line keys or the record has no
    /// value at the key path.
    pub fn extract_key(&self, record: &Value) -> Result<Option<Key>> {
        match &self.key_path {
            Some(path) => path.extract(record),
            None => Ok(None),
        }
    }

    /// Two store schemas are similar iff they agree on every declared
    /// field: name, key path, key type, and each index's full declaration.
    pub fn similar(&self, other: &StoreSchema) -> bool {
        if self.name != other.name
            || self.key_path != other.key_path
            || self.key_type != other.key_type
            || self.auto_increment != other.auto_increment
            || self.indexes.len() != other.indexes.len()
        {
            return false;
        }
        self.indexes
            .iter()
            .all(|ix| other.index(&ix.name).is_some_and(|o| o == ix))
    }
}

// Database schema

/// Editability of a database schema.
///
/// `Editable` corresponds to auto-schema mode: stores may be added at
/// runtime. On a `Fixed` schema, adding a store is a constraint violation
/// outside a version-change upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    Fixed,
    Editable,
}

/// The set of declared stores plus versioning information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DatabaseSchemaRepr", into = "DatabaseSchemaRepr")]
pub struct DatabaseSchema {
    version: Option<u32>,
    mode: SchemaMode,
    stores: IndexMap<String, StoreSchema>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseSchemaRepr {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(default)]
    auto_schema: bool,
    #[serde(default)]
    stores: Vec<StoreSchema>,
}

impl TryFrom<DatabaseSchemaRepr> for DatabaseSchema {
    type Error = DbError;

    fn try_from(repr: DatabaseSchemaRepr) -> Result<Self> {
        let mut stores = IndexMap::new();
        for store in repr.stores {
            if stores.insert(store.name.clone(), store).is_some() {
                return Err(DbError::Argument("duplicate store name in schema".into()));
            }
        }
        Ok(DatabaseSchema {
            version: repr.version,
            mode: if repr.auto_schema {
                SchemaMode::Editable
            } else {
                SchemaMode::Fixed
            },
            stores,
        })
    }
}

impl From<DatabaseSchema> for DatabaseSchemaRepr {
    fn from(schema: DatabaseSchema) -> Self {
        DatabaseSchemaRepr {
            version: schema.version,
            auto_schema: schema.mode == SchemaMode::Editable,
            stores: schema.stores.into_values().collect(),
        }
    }
}

impl Default for DatabaseSchema {
    fn default() -> Self {
        // No declared stores: editable, so runtime additions are allowed.
        DatabaseSchema {
            version: None,
            mode: SchemaMode::Editable,
            stores: IndexMap::new(),
        }
    }
}

impl DatabaseSchema {
    /// A fixed schema from declared stores.
    pub fn fixed(stores: Vec<StoreSchema>) -> Self {
        Self::with_mode(stores, SchemaMode::Fixed)
    }

    /// An editable (auto-schema) schema from declared stores.
    pub fn editable(stores: Vec<StoreSchema>) -> Self {
        Self::with_mode(stores, SchemaMode::Editable)
    }

    fn with_mode(stores: Vec<StoreSchema>, mode: SchemaMode) -> Self {
        DatabaseSchema {
            version: None,
            mode,
            stores: stores
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
        }
    }

    /// Parse the JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| DbError::Argument(format!("invalid schema JSON: {e}")))
    }

    /// The stable JSON form.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.clone()).expect("schema serialization is infallible")
    }

    pub fn mode(&self) -> SchemaMode {
        self.mode
    }

    pub fn is_editable(&self) -> bool {
        self.mode == SchemaMode::Editable
    }

    /// Switch to auto-schema (editable) mode.
    pub fn into_editable(mut self) -> Self {
        self.mode = SchemaMode::Editable;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// The declared version, or one derived from the schema hash when
    /// auto-versioning (no explicit version).
    pub fn version(&self) -> u32 {
        match self.version {
            Some(v) => v,
            None => self.hash_version(),
        }
    }

    fn hash_version(&self) -> u32 {
        let stores: Vec<&StoreSchema> = self.stores.values().collect();
        let canonical =
            serde_json::to_string(&stores).expect("schema serialization is infallible");
        let digest = Sha256::digest(canonical.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]).max(1)
    }

    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.get(name)
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn stores(&self) -> impl Iterator<Item = &StoreSchema> {
        self.stores.values()
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    pub fn has_index(&self, store: &str, field: &str) -> bool {
        self.store(store).is_some_and(|s| s.has_index(field))
    }

    /// Add a store at runtime. Only editable schemas accept this.
    pub fn add_store(&mut self, store: StoreSchema) -> Result<()> {
        if self.mode == SchemaMode::Fixed {
            return Err(DbError::Constraint(format!(
                "schema is not editable, cannot add store '{}'",
                store.name
            )));
        }
        if self.stores.contains_key(&store.name) {
            return Err(DbError::Constraint(format!(
                "store '{}' already exists",
                store.name
            )));
        }
        self.stores.insert(store.name.clone(), store);
        Ok(())
    }

    /// Insert a store during a version-change upgrade. Bypasses the
    /// editability check, which only governs runtime additions.
    pub fn upgrade_store(&mut self, store: StoreSchema) {
        self.stores.insert(store.name.clone(), store);
    }

    /// Two database schemas are similar iff they declare the same store
    /// names and each pair of stores is similar.
    pub fn similar(&self, other: &DatabaseSchema) -> bool {
        self.stores.len() == other.stores.len()
            && self.stores.values().all(|s| {
                other.store(&s.name).is_some_and(|o| s.similar(o))
            })
    }

    /// Compute the upgrade delta from a persisted schema to this one.
    pub fn delta_from(&self, persisted: &DatabaseSchema) -> SchemaDelta {
        let mut delta = SchemaDelta::default();
        for wanted in self.stores.values() {
            match persisted.store(&wanted.name) {
                None => delta.create_stores.push(wanted.clone()),
                Some(old) if !old.similar(wanted) => {
                    for ix in &wanted.indexes {
                        if old.index(&ix.name).is_none_or(|o| o != ix) {
                            delta
                                .create_indexes
                                .push((wanted.name.clone(), ix.clone()));
                        }
                    }
                    for old_ix in &old.indexes {
                        if wanted.index(&old_ix.name).is_none() {
                            delta
                                .drop_indexes
                                .push((wanted.name.clone(), old_ix.name.clone()));
                        }
                    }
                }
                Some(_) => {}
            }
        }
        delta
    }
}

/// The store/index changes a version-change transaction must apply.
#[derive(Debug, Clone, Default)]
pub struct SchemaDelta {
    pub create_stores: Vec<StoreSchema>,
    pub create_indexes: Vec<(String, IndexSchema)>,
    pub drop_indexes: Vec<(String, String)>,
}

impl SchemaDelta {
    pub fn is_empty(&self) -> bool {
        self.create_stores.is_empty()
            && self.create_indexes.is_empty()
            && self.drop_indexes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DatabaseSchema {
        DatabaseSchema::fixed(vec![
            StoreSchema::new("orders")
                .with_key_path("id", KeyType::Number)
                .with_index(IndexSchema::new("price", KeyType::Number))
                .with_index(IndexSchema::new("tag", KeyType::Text).unique()),
            StoreSchema::new("notes").with_key_path("slug", KeyType::Text),
        ])
    }

    #[test]
    fn json_round_trip_preserves_similarity() {
        let schema = sample();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed = DatabaseSchema::from_json(&json).unwrap();
        assert!(schema.similar(&parsed));
        assert_eq!(schema.version(), parsed.version());
    }

    #[test]
    fn key_path_json_form_is_string_or_array() {
        let single = serde_json::to_value(KeyPath::Single("a.b".into())).unwrap();
        assert_eq!(single, serde_json::json!("a.b"));

        let tuple = serde_json::to_value(KeyPath::Tuple(vec!["a".into(), "b".into()])).unwrap();
        assert_eq!(tuple, serde_json::json!(["a", "b"]));
    }

    #[test]
    fn add_store_fails_on_fixed_schema() {
        let mut schema = sample();
        let err = schema.add_store(StoreSchema::new("extra")).unwrap_err();
        assert_eq!(err.kind(), "constraint_error");

        let mut editable = DatabaseSchema::editable(vec![]);
        editable.add_store(StoreSchema::new("extra")).unwrap();
        assert!(editable.has_store("extra"));
    }

    #[test]
    fn similar_ignores_nothing() {
        let a = sample();
        let mut b = sample();
        assert!(a.similar(&b));

        // Flipping a unique flag breaks similarity.
        b.upgrade_store(
            StoreSchema::new("orders")
                .with_key_path("id", KeyType::Number)
                .with_index(IndexSchema::new("price", KeyType::Number))
                .with_index(IndexSchema::new("tag", KeyType::Text)),
        );
        assert!(!a.similar(&b));
    }

    #[test]
    fn delta_reports_new_stores_and_index_changes() {
        let persisted = DatabaseSchema::fixed(vec![
            StoreSchema::new("orders")
                .with_key_path("id", KeyType::Number)
                .with_index(IndexSchema::new("price", KeyType::Number)),
        ]);
        let wanted = sample();
        let delta = wanted.delta_from(&persisted);

        assert_eq!(delta.create_stores.len(), 1);
        assert_eq!(delta.create_stores[0].name, "notes");
        assert_eq!(delta.create_indexes.len(), 1);
        assert_eq!(delta.create_indexes[0].1.name, "tag");
        assert!(delta.drop_indexes.is_empty());
    }

    #[test]
    fn auto_version_changes_with_schema() {
        let a = sample();
        let mut b = sample();
        b.upgrade_store(StoreSchema::new("extra"));
        assert_ne!(a.version(), b.version());
        assert_eq!(a.with_version(9).version(), 9);
    }

    #[test]
    fn tuple_key_path_extracts_tuple_keys() {
        let path = KeyPath::Tuple(vec!["a".into(), "b".into()]);
        let rec = crate::record! { "a" => 1i64, "b" => "x" };
        let key = path.extract(&rec).unwrap().unwrap();
        assert_eq!(
            key,
            Key::Tuple(vec![Key::Number(1.0), Key::Text("x".into())])
        );

        let partial = crate::record! { "a" => 1i64 };
        assert_eq!(path.extract(&partial).unwrap(), None);
    }
}
