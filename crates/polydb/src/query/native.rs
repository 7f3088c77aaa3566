//! Compilation to a native cursor descriptor, and its execution against
//! backends that consume scan plans directly.

use polydb_common::{DatabaseSchema, DbError, Key, KeyRange, Result, Value};

use crate::backend::{CursorRow, Direction, ScanPlan, StoreTx};

use super::ir::{select_access_path, MapExpr, QueryIr, ReduceExpr, WhereClause};

/// What the native backend consumes: an index range scan plus per-row
/// post-processing.
#[derive(Debug, Clone)]
pub struct CursorDescriptor {
    pub store: String,
    pub index: Option<String>,
    pub range: Option<KeyRange>,
    pub direction: Direction,
    /// Post-range predicates, evaluated per row.
    pub filters: Vec<WhereClause>,
    pub map: Option<MapExpr>,
    pub reduce: Option<ReduceExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Lower an IR onto the store's indexes.
pub fn compile(ir: &QueryIr, schema: &DatabaseSchema) -> Result<CursorDescriptor> {
    let store = schema
        .store(&ir.store)
        .ok_or_else(|| DbError::Argument(format!("unknown store '{}'", ir.store)))?;
    let path = select_access_path(ir, store)?;
    Ok(CursorDescriptor {
        store: ir.store.clone(),
        index: path.index.map(|ix| ix.name),
        range: path.range,
        direction: ir.direction,
        filters: path.filters,
        map: ir.map.clone(),
        reduce: ir.reduce.clone(),
        limit: ir.limit,
        offset: ir.offset,
    })
}

/// Compile and run an IR on a native-scanning backend.
pub fn execute(tx: &mut dyn StoreTx, ir: &QueryIr, schema: &DatabaseSchema) -> Result<Value> {
    let descriptor = compile(ir, schema)?;
    execute_descriptor(tx, &descriptor)
}

/// Run a cursor descriptor: scan, suppress duplicates for unique
/// directions, filter, window, then map or reduce.
pub fn execute_descriptor(tx: &mut dyn StoreTx, d: &CursorDescriptor) -> Result<Value> {
    // A bare count never needs the record payloads.
    let key_only =
        d.map.is_none() && d.filters.is_empty() && matches!(d.reduce, Some(ReduceExpr::Count));

    let plan = ScanPlan {
        store: d.store.clone(),
        index: d.index.clone(),
        range: d.range.clone(),
        direction: d.direction,
        key_only,
    };
    let mut rows = tx.scan(&plan)?;

    if d.direction.is_unique() {
        dedupe_by_effective_key(&mut rows);
    }
    if !d.filters.is_empty() {
        rows.retain(|row| filters_match(&d.filters, row.value.as_ref()));
    }

    let offset = d.offset.unwrap_or(0) as usize;
    let rows: Vec<CursorRow> = match d.limit {
        Some(limit) => rows.into_iter().skip(offset).take(limit as usize).collect(),
        None => rows.into_iter().skip(offset).collect(),
    };

    match &d.reduce {
        Some(ReduceExpr::Count) => Ok(Value::Number(rows.len() as f64)),
        Some(reduce) => {
            let records: Vec<Value> = rows.into_iter().filter_map(|r| r.value).collect();
            reduce_records(reduce, &records)
        }
        None => {
            let items: Vec<Value> = rows
                .into_iter()
                .map(|row| {
                    let record = row.value.unwrap_or(Value::Null);
                    match &d.map {
                        Some(map) => apply_map(map, &record),
                        None => record,
                    }
                })
                .collect();
            Ok(Value::Array(items))
        }
    }
}

/// Keep the first row of each run of equal effective keys.
pub(crate) fn dedupe_by_effective_key(rows: &mut Vec<CursorRow>) {
    rows.dedup_by(|a, b| a.effective_key == b.effective_key);
}

/// Evaluate the residual filters against a record.
pub(crate) fn filters_match(filters: &[WhereClause], record: Option<&Value>) -> bool {
    let Some(record) = record else {
        return false;
    };
    filters.iter().all(|clause| {
        record
            .get_path(&clause.field)
            .and_then(|v| Key::from_value(v).ok())
            .is_some_and(|key| clause.range.contains(&key))
    })
}

/// Apply a per-row projection.
pub(crate) fn apply_map(map: &MapExpr, record: &Value) -> Value {
    match map {
        MapExpr::Field(field) => record.get_path(field).cloned().unwrap_or(Value::Null),
        MapExpr::Project(fields) => {
            let mut out = indexmap::IndexMap::new();
            for field in fields {
                out.insert(
                    field.clone(),
                    record.get_path(field).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(out)
        }
    }
}

/// Fold a record stream through a reduce.
///
/// Sum starts at 0; min/max/avg start undefined and the first element
/// initializes them. The average is maintained as an incremental mean so a
/// long stream cannot overflow a summed accumulator.
pub(crate) fn reduce_records(reduce: &ReduceExpr, records: &[Value]) -> Result<Value> {
    match reduce {
        ReduceExpr::Count => Ok(Value::Number(records.len() as f64)),
        ReduceExpr::Sum(field) => {
            let sum = numeric_values(records, field).sum::<f64>();
            Ok(Value::Number(sum))
        }
        ReduceExpr::Avg(field) => {
            let mut mean: Option<f64> = None;
            for (i, x) in numeric_values(records, field).enumerate() {
                mean = Some(match mean {
                    None => x,
                    Some(prev) => ((prev * i as f64) + x) / (i as f64 + 1.0),
                });
            }
            Ok(mean.map(Value::Number).unwrap_or(Value::Null))
        }
        ReduceExpr::Min(field) => Ok(extremum(records, field, false)),
        ReduceExpr::Max(field) => Ok(extremum(records, field, true)),
        ReduceExpr::Concat(field) => {
            let mut out = String::new();
            for record in records {
                match record.get_path(field) {
                    Some(Value::Text(s)) => out.push_str(s),
                    Some(Value::Null) | None => {}
                    Some(other) => out.push_str(&other.to_json().to_string()),
                }
            }
            Ok(Value::Text(out))
        }
    }
}

fn numeric_values<'a>(
    records: &'a [Value],
    field: &'a str,
) -> impl Iterator<Item = f64> + 'a {
    records
        .iter()
        .filter_map(move |record| record.get_path(field).and_then(Value::as_f64))
}

fn extremum(records: &[Value], field: &str, want_max: bool) -> Value {
    let mut best: Option<(Key, Value)> = None;
    for record in records {
        let Some(value) = record.get_path(field) else {
            continue;
        };
        let Ok(key) = Key::from_value(value) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((best_key, _)) => {
                if want_max {
                    key > *best_key
                } else {
                    key < *best_key
                }
            }
        };
        if better {
            best = Some((key, value.clone()));
        }
    }
    best.map(|(_, v)| v).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::NativeDriver;
    use crate::backend::{Driver, TxMode};
    use polydb_common::record;
    use polydb_common::schema::{IndexSchema, KeyType, StoreSchema};

    fn driver() -> NativeDriver {
        let schema = DatabaseSchema::fixed(vec![StoreSchema::new("orders")
            .with_key_path("id", KeyType::Number)
            .with_index(IndexSchema::new("k", KeyType::Text))
            .with_index(IndexSchema::new("price", KeyType::Number))]);
        let driver = NativeDriver::new();
        driver.connect("t", &schema).unwrap();
        driver.transaction(
            &["orders".to_string()],
            TxMode::ReadWrite,
            Box::new(|tx| {
                for (id, k, price) in
                    [(1, "a", 1.0), (2, "a", 2.0), (3, "b", 3.0), (4, "b", 4.0)]
                {
                    tx.put(
                        "orders",
                        record! { "id" => id as i64, "k" => k, "price" => price },
                        None,
                    )?;
                }
                Ok(Value::Null)
            }),
        );
        driver
    }

    fn run(driver: &NativeDriver, ir: QueryIr) -> Value {
        driver
            .transaction(
                &["orders".to_string()],
                TxMode::ReadOnly,
                Box::new(move |tx| {
                    let schema = tx.schema();
                    ir.validate(&schema)?;
                    execute(tx, &ir, &schema)
                }),
            )
            .result
            .unwrap()
    }

    #[test]
    fn unique_direction_suppresses_duplicate_index_keys() {
        let driver = driver();
        let ir = QueryIr::new("orders")
            .with_index("k")
            .with_direction(Direction::NextUnique)
            .with_map(MapExpr::Field("k".into()));
        let out = run(&driver, ir);
        assert_eq!(
            out,
            Value::Array(vec![Value::Text("a".into()), Value::Text("b".into())])
        );
    }

    #[test]
    fn sum_over_price_matches_hand_total() {
        let driver = driver();
        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Sum("price".into()));
        assert_eq!(run(&driver, ir), Value::Number(10.0));
    }

    #[test]
    fn avg_uses_incremental_mean() {
        let driver = driver();
        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Avg("price".into()));
        assert_eq!(run(&driver, ir), Value::Number(2.5));

        // Average of an empty stream stays undefined.
        let ir = QueryIr::new("orders")
            .with_where(WhereClause::new(
                "price",
                KeyRange::lower_bound(Key::Number(100.0), false),
            ))
            .with_reduce(ReduceExpr::Avg("price".into()));
        assert_eq!(run(&driver, ir), Value::Null);
    }

    #[test]
    fn non_indexed_wheres_become_filters() {
        let driver = driver();
        // "flag" is not indexed: records lack it entirely, so the filter
        // rejects every row.
        let ir = QueryIr::new("orders")
            .with_where(WhereClause::new("flag", KeyRange::only(Key::Number(1.0))))
            .with_reduce(ReduceExpr::Count);
        assert_eq!(run(&driver, ir), Value::Number(0.0));
    }

    #[test]
    fn limit_and_offset_window_the_stream() {
        let driver = driver();
        let ir = QueryIr::new("orders")
            .with_index("price")
            .with_map(MapExpr::Field("id".into()))
            .with_offset(1)
            .with_limit(2);
        assert_eq!(
            run(&driver, ir),
            Value::Array(vec![Value::Number(2.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn min_max_return_field_values() {
        let driver = driver();
        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Max("k".into()));
        assert_eq!(run(&driver, ir), Value::Text("b".into()));

        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Min("price".into()));
        assert_eq!(run(&driver, ir), Value::Number(1.0));
    }

    #[test]
    fn projection_builds_partial_records() {
        let driver = driver();
        let ir = QueryIr::new("orders")
            .with_where(WhereClause::new("k", KeyRange::only("b".into())))
            .with_map(MapExpr::Project(vec!["id".into(), "price".into()]));
        let out = run(&driver, ir);
        let Value::Array(items) = out else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].get_path("id"), Some(&Value::Number(3.0)));
        assert_eq!(items[0].get_path("price"), Some(&Value::Number(3.0)));
        assert_eq!(items[0].get_path("k"), None);
    }
}
