//! The query intermediate representation.
//!
//! An IR is what both compiler targets consume: a store, an optional index,
//! a direction, conjunct range predicates, and at most one map and one
//! reduce. The `Option`s make the zero-or-one invariants structural.

use polydb_common::{
    DatabaseSchema, DbError, IndexSchema, KeyPath, KeyRange, Result, StoreSchema,
};

use crate::backend::Direction;

/// A conjunct range predicate on one record field.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClause {
    pub field: String,
    pub range: KeyRange,
}

impl WhereClause {
    pub fn new(field: impl Into<String>, range: KeyRange) -> Self {
        WhereClause {
            field: field.into(),
            range,
        }
    }
}

/// Per-row projection.
#[derive(Debug, Clone, PartialEq)]
pub enum MapExpr {
    /// Project a single field's value.
    Field(String),
    /// Project a record holding the named fields.
    Project(Vec<String>),
}

/// Stream accumulation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceExpr {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    Concat(String),
}

/// A compiled-form query over one store.
#[derive(Debug, Clone, Default)]
pub struct QueryIr {
    pub store: String,
    pub index: Option<String>,
    pub direction: Direction,
    pub wheres: Vec<WhereClause>,
    pub map: Option<MapExpr>,
    pub reduce: Option<ReduceExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryIr {
    pub fn new(store: impl Into<String>) -> Self {
        QueryIr {
            store: store.into(),
            ..QueryIr::default()
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_where(mut self, clause: WhereClause) -> Self {
        self.wheres.push(clause);
        self
    }

    pub fn with_map(mut self, map: MapExpr) -> Self {
        self.map = Some(map);
        self
    }

    pub fn with_reduce(mut self, reduce: ReduceExpr) -> Self {
        self.reduce = Some(reduce);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Check the IR invariants against a schema: the store exists, a named
    /// index is declared (or is the store's key path field), and no field
    /// carries more than one where.
    pub fn validate(&self, schema: &DatabaseSchema) -> Result<()> {
        let store = schema
            .store(&self.store)
            .ok_or_else(|| DbError::Argument(format!("unknown store '{}'", self.store)))?;

        if let Some(index) = &self.index
            && store.index(index).is_none()
            && !is_primary_field(store, index)
        {
            return Err(DbError::Argument(format!(
                "store '{}' has no index '{index}'",
                self.store
            )));
        }

        for (i, clause) in self.wheres.iter().enumerate() {
            if self.wheres[..i].iter().any(|w| w.field == clause.field) {
                return Err(DbError::SqlParse(format!(
                    "duplicate where clause on field '{}'",
                    clause.field
                )));
            }
        }
        Ok(())
    }
}

/// Whether `field` is the store's (single) primary key path.
pub(crate) fn is_primary_field(store: &StoreSchema, field: &str) -> bool {
    matches!(&store.key_path, Some(KeyPath::Single(path)) if path == field)
}

/// How a query reaches the store: through which index (or the primary
/// order), over which range, with which residual filters.
#[derive(Debug, Clone)]
pub(crate) struct AccessPath {
    /// `None` means primary-key order.
    pub index: Option<IndexSchema>,
    pub range: Option<KeyRange>,
    pub filters: Vec<WhereClause>,
}

/// Pick the scan index per the compilation rule: a named index wins;
/// otherwise the first where whose field is an index of the store (or its
/// primary key) supplies the key range. Remaining wheres become filters.
pub(crate) fn select_access_path(ir: &QueryIr, store: &StoreSchema) -> Result<AccessPath> {
    let mut filters = ir.wheres.clone();

    if let Some(name) = &ir.index {
        let (index, order_field) = match store.index(name) {
            Some(ix) => {
                let field = match ix.effective_key_path() {
                    KeyPath::Single(path) => Some(path),
                    KeyPath::Tuple(_) => None,
                };
                (Some(ix.clone()), field)
            }
            None if is_primary_field(store, name) => (None, Some(name.clone())),
            None => {
                return Err(DbError::Argument(format!(
                    "store '{}' has no index '{name}'",
                    store.name
                )));
            }
        };
        let position = order_field
            .and_then(|field| filters.iter().position(|w| w.field == field));
        let range = position.map(|i| filters.remove(i).range);
        return Ok(AccessPath {
            index,
            range,
            filters,
        });
    }

    let mut chosen: Option<(usize, Option<IndexSchema>)> = None;
    for (i, clause) in filters.iter().enumerate() {
        if let Some(ix) = store.index_for_field(&clause.field) {
            chosen = Some((i, Some(ix.clone())));
            break;
        }
        if is_primary_field(store, &clause.field) {
            chosen = Some((i, None));
            break;
        }
    }

    match chosen {
        Some((i, index)) => {
            let range = filters.remove(i).range;
            Ok(AccessPath {
                index,
                range: Some(range),
                filters,
            })
        }
        None => Ok(AccessPath {
            index: None,
            range: None,
            filters,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polydb_common::schema::{IndexSchema, KeyType};
    use polydb_common::{Key, StoreSchema};

    fn store() -> StoreSchema {
        StoreSchema::new("st")
            .with_key_path("id", KeyType::Number)
            .with_index(IndexSchema::new("k", KeyType::Text))
            .with_index(IndexSchema::new("price", KeyType::Number))
    }

    fn schema() -> DatabaseSchema {
        DatabaseSchema::fixed(vec![store()])
    }

    #[test]
    fn duplicate_where_field_is_a_compile_error() {
        let ir = QueryIr::new("st")
            .with_where(WhereClause::new("k", KeyRange::lower_bound("a".into(), false)))
            .with_where(WhereClause::new("k", KeyRange::upper_bound("z".into(), false)));
        let err = ir.validate(&schema()).unwrap_err();
        assert_eq!(err.kind(), "sql_parse_error");
    }

    #[test]
    fn unknown_store_and_index_are_rejected() {
        assert_eq!(
            QueryIr::new("nope").validate(&schema()).unwrap_err().kind(),
            "argument_error"
        );
        assert_eq!(
            QueryIr::new("st")
                .with_index("nope")
                .validate(&schema())
                .unwrap_err()
                .kind(),
            "argument_error"
        );
    }

    #[test]
    fn first_indexed_where_supplies_the_range() {
        let ir = QueryIr::new("st")
            .with_where(WhereClause::new("other", KeyRange::only(Key::Number(1.0))))
            .with_where(WhereClause::new("price", KeyRange::lower_bound(Key::Number(5.0), false)))
            .with_where(WhereClause::new("k", KeyRange::only("x".into())));
        let path = select_access_path(&ir, &store()).unwrap();
        assert_eq!(path.index.as_ref().map(|ix| ix.name.as_str()), Some("price"));
        assert!(path.range.is_some());
        // The non-chosen wheres stay behind as filters, in order.
        let fields: Vec<&str> = path.filters.iter().map(|w| w.field.as_str()).collect();
        assert_eq!(fields, vec!["other", "k"]);
    }

    #[test]
    fn named_index_wins_and_takes_its_where() {
        let ir = QueryIr::new("st")
            .with_index("k")
            .with_where(WhereClause::new("price", KeyRange::only(Key::Number(1.0))))
            .with_where(WhereClause::new("k", KeyRange::only("x".into())));
        let path = select_access_path(&ir, &store()).unwrap();
        assert_eq!(path.index.as_ref().map(|ix| ix.name.as_str()), Some("k"));
        assert!(path.range.is_some());
        assert_eq!(path.filters.len(), 1);
        assert_eq!(path.filters[0].field, "price");
    }

    #[test]
    fn primary_key_where_scans_the_store_order() {
        let ir = QueryIr::new("st").with_where(WhereClause::new(
            "id",
            KeyRange::lower_bound(Key::Number(2.0), true),
        ));
        let path = select_access_path(&ir, &store()).unwrap();
        assert!(path.index.is_none());
        assert!(path.range.is_some());
        assert!(path.filters.is_empty());
    }
}
