//! Compilation to a generated SQL statement plus a post-processing
//! pipeline, semantically equivalent to the native lowering.
//!
//! Where-clauses over indexed fields become SQL predicates with parameter
//! bindings; non-indexed fields stay behind as runtime filters. Unique
//! directions emit `DISTINCT` when the projection is the effective key, and
//! fall back to pipeline deduplication when record payloads are needed.
//! Aggregates lower to the SQL aggregate of the same name when the field
//! has a column, otherwise to the shared reduce fold over `__rec`.

use polydb_common::keyrange::quote_ident;
use polydb_common::{DatabaseSchema, DbError, Key, Result, StoreSchema, Value};

use crate::backend::sql::{
    index_col_base, index_columns, record_from_sql, SqlParam, SqlValue, PK_COL, REC_COL,
};
use crate::backend::StoreTx;

use super::ir::{is_primary_field, select_access_path, MapExpr, QueryIr, ReduceExpr, WhereClause};
use super::native::{apply_map, filters_match, reduce_records};

/// A compiled SQL query: the statement, its bindings, the projection
/// layout, and the stages still to run on the materialized rows.
#[derive(Debug, Clone)]
pub struct SqlCompiled {
    pub sql: String,
    pub params: Vec<SqlParam>,
    /// Leading effective-key columns in the projection (0 when none).
    pub key_cols: usize,
    /// Whether the projection ends with the serialized record column.
    pub has_record: bool,
    /// Drop rows whose leading key cells are NULL (index-scan semantics).
    pub skip_null_keys: bool,
    pub pipeline: PostPipeline,
}

/// Stages applied to the materialized rows, in field order.
#[derive(Debug, Clone, Default)]
pub struct PostPipeline {
    pub filters: Vec<WhereClause>,
    pub unique: bool,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub map: Option<MapExpr>,
    pub reduce: Option<ReduceExpr>,
    /// Extract the first column of the first row (SQL aggregates).
    pub finalize_take_first: bool,
}

/// The column a record field projects onto, if it has one.
fn field_column(store: &StoreSchema, field: &str) -> Option<String> {
    if is_primary_field(store, field) {
        return Some(PK_COL.to_string());
    }
    store.index_for_field(field).and_then(|ix| {
        let cols = index_columns(ix);
        // Tuple indexes span several columns; a single field predicate
        // cannot bind to them.
        (cols.len() == 1).then(|| cols[0].clone())
    })
}

/// Lower an IR to SQL text, bindings, and a post-processing pipeline.
pub fn compile(ir: &QueryIr, schema: &DatabaseSchema) -> Result<SqlCompiled> {
    let store = schema
        .store(&ir.store)
        .ok_or_else(|| DbError::Argument(format!("unknown store '{}'", ir.store)))?;
    let path = select_access_path(ir, store)?;

    let (order_cols, order_base) = match &path.index {
        Some(ix) => (index_columns(ix), index_col_base(&ix.name)),
        None => (vec![PK_COL.to_string()], PK_COL.to_string()),
    };
    let order_field: Option<String> = match &path.index {
        Some(ix) => match ix.effective_key_path() {
            polydb_common::KeyPath::Single(p) => Some(p),
            polydb_common::KeyPath::Tuple(_) => None,
        },
        None => match &store.key_path {
            Some(polydb_common::KeyPath::Single(p)) => Some(p.clone()),
            _ => None,
        },
    };

    // Split residual wheres into SQL predicates and runtime filters.
    let mut where_sql = match &path.range {
        Some(range) => range.to_sql(&order_base),
        None => Default::default(),
    };
    let mut runtime_filters = Vec::new();
    for clause in path.filters {
        match field_column(store, &clause.field) {
            Some(column) => {
                let fragment = clause.range.to_sql(&column);
                if !fragment.is_empty() {
                    where_sql.and(&fragment.sql, fragment.params);
                }
            }
            None => runtime_filters.push(clause),
        }
    }

    let unique = ir.direction.is_unique();
    let desc = ir.direction.is_reverse();

    if let Some(reduce) = &ir.reduce {
        return compile_aggregate(
            ir,
            store,
            reduce,
            where_sql,
            &order_cols,
            desc,
            unique,
            runtime_filters,
        );
    }

    // Plain SELECT. Fast path: a single-field projection that lives in a
    // column, with nothing left to filter at runtime.
    if let Some(MapExpr::Field(field)) = &ir.map
        && runtime_filters.is_empty()
        && let Some(column) = field_column(store, field)
        && (!unique || order_field.as_deref() == Some(field.as_str()))
    {
        let distinct = if unique { "DISTINCT " } else { "" };
        let mut sql = format!(
            "SELECT {distinct}{} FROM {}",
            quote_ident(&column),
            quote_ident(&store.name),
        );
        append_where(&mut sql, &where_sql.sql);
        append_order(&mut sql, &order_cols, desc);
        append_window(&mut sql, ir.limit, ir.offset);
        return Ok(SqlCompiled {
            sql,
            params: where_sql.params.into_iter().map(SqlParam::Key).collect(),
            key_cols: 1,
            has_record: false,
            skip_null_keys: path.index.is_some() && order_field.as_deref() == Some(field.as_str()),
            pipeline: PostPipeline::default(),
        });
    }

    // General path: project the record, plus the effective key when the
    // pipeline needs to deduplicate.
    let mut columns: Vec<String> = Vec::new();
    if unique {
        columns.extend(order_cols.iter().cloned());
    }
    columns.push(REC_COL.to_string());

    let mut sql = format!(
        "SELECT {} FROM {}",
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        quote_ident(&store.name),
    );
    append_where(&mut sql, &where_sql.sql);
    append_order(&mut sql, &order_cols, desc);

    let window_in_sql = runtime_filters.is_empty() && !unique;
    if window_in_sql {
        append_window(&mut sql, ir.limit, ir.offset);
    }

    Ok(SqlCompiled {
        sql,
        params: where_sql.params.into_iter().map(SqlParam::Key).collect(),
        key_cols: if unique { order_cols.len() } else { 0 },
        has_record: true,
        skip_null_keys: false,
        pipeline: PostPipeline {
            filters: runtime_filters,
            unique,
            offset: (!window_in_sql).then_some(ir.offset).flatten(),
            limit: (!window_in_sql).then_some(ir.limit).flatten(),
            map: ir.map.clone(),
            reduce: None,
            finalize_take_first: false,
        },
    })
}

#[allow(clippy::too_many_arguments)]
fn compile_aggregate(
    ir: &QueryIr,
    store: &StoreSchema,
    reduce: &ReduceExpr,
    where_sql: polydb_common::SqlFragment,
    order_cols: &[String],
    desc: bool,
    unique: bool,
    runtime_filters: Vec<WhereClause>,
) -> Result<SqlCompiled> {
    let sql_aggregate: Option<(&str, Option<String>)> = match reduce {
        ReduceExpr::Count => Some(("COUNT", None)),
        ReduceExpr::Sum(f) => field_column(store, f).map(|c| ("SUM", Some(c))),
        ReduceExpr::Avg(f) => field_column(store, f).map(|c| ("AVG", Some(c))),
        ReduceExpr::Min(f) => field_column(store, f).map(|c| ("MIN", Some(c))),
        ReduceExpr::Max(f) => field_column(store, f).map(|c| ("MAX", Some(c))),
        ReduceExpr::Concat(_) => {
            return Err(DbError::NotImplemented(
                "CONCAT is not available on the sql mechanism".into(),
            ));
        }
    };

    if let Some((name, column)) = sql_aggregate
        && runtime_filters.is_empty()
        && !unique
    {
        let target = match &column {
            Some(c) => quote_ident(c),
            None => "*".to_string(),
        };
        let mut sql = format!(
            "SELECT {name}({target}) FROM {}",
            quote_ident(&store.name),
        );
        append_where(&mut sql, &where_sql.sql);
        return Ok(SqlCompiled {
            sql,
            params: where_sql.params.into_iter().map(SqlParam::Key).collect(),
            key_cols: 0,
            has_record: false,
            skip_null_keys: false,
            pipeline: PostPipeline {
                reduce: Some(reduce.clone()),
                finalize_take_first: true,
                ..PostPipeline::default()
            },
        });
    }

    // Fallback: materialize records and run the shared reduce fold.
    let mut columns: Vec<String> = Vec::new();
    if unique {
        columns.extend(order_cols.iter().cloned());
    }
    columns.push(REC_COL.to_string());
    let mut sql = format!(
        "SELECT {} FROM {}",
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        quote_ident(&store.name),
    );
    append_where(&mut sql, &where_sql.sql);
    append_order(&mut sql, order_cols, desc);

    Ok(SqlCompiled {
        sql,
        params: where_sql.params.into_iter().map(SqlParam::Key).collect(),
        key_cols: if unique { order_cols.len() } else { 0 },
        has_record: true,
        skip_null_keys: false,
        pipeline: PostPipeline {
            filters: runtime_filters,
            unique,
            offset: ir.offset,
            limit: ir.limit,
            map: None,
            reduce: Some(reduce.clone()),
            finalize_take_first: false,
        },
    })
}

fn append_where(sql: &mut String, clause: &str) {
    if !clause.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(clause);
    }
}

fn append_order(sql: &mut String, order_cols: &[String], desc: bool) {
    let dir = if desc { "DESC" } else { "ASC" };
    let order: Vec<String> = order_cols
        .iter()
        .map(|c| format!("{} {dir}", quote_ident(c)))
        .collect();
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));
}

fn append_window(sql: &mut String, limit: Option<u64>, offset: Option<u64>) {
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
}

// Execution

struct PipeRow {
    head: Option<Key>,
    record: Option<Value>,
}

/// Compile and run an IR on the relational backend.
pub fn execute(tx: &mut dyn StoreTx, ir: &QueryIr, schema: &DatabaseSchema) -> Result<Value> {
    let compiled = compile(ir, schema)?;
    let reduce = ir.reduce.clone();
    let exec = tx.sql().ok_or_else(|| {
        DbError::Internal("sql compilation targeted a non-relational backend".into())
    })?;
    let raw = exec.query(&compiled.sql, &compiled.params)?;

    if compiled.pipeline.finalize_take_first {
        let cell = raw
            .first()
            .and_then(|row| row.0.first())
            .cloned()
            .unwrap_or(SqlValue::Null);
        return finalize_aggregate(reduce.as_ref(), cell);
    }

    // Decode the projection layout.
    let mut rows: Vec<PipeRow> = Vec::with_capacity(raw.len());
    for row in raw {
        let cells = row.0;
        if compiled.skip_null_keys
            && cells[..compiled.key_cols]
                .iter()
                .any(|c| matches!(c, SqlValue::Null))
        {
            continue;
        }
        let head = if compiled.key_cols == 0 {
            None
        } else if compiled.key_cols == 1 {
            match &cells[0] {
                SqlValue::Key(k) => Some(k.clone()),
                _ => None,
            }
        } else {
            let mut parts = Vec::with_capacity(compiled.key_cols);
            for cell in &cells[..compiled.key_cols] {
                match cell {
                    SqlValue::Key(k) => parts.push(k.clone()),
                    _ => {}
                }
            }
            (parts.len() == compiled.key_cols).then(|| Key::Tuple(parts))
        };
        let record = if compiled.has_record {
            match cells.last() {
                Some(SqlValue::Text(text)) => Some(record_from_sql(text)?),
                _ => None,
            }
        } else {
            None
        };
        rows.push(PipeRow { head, record });
    }

    run_pipeline(&compiled, rows)
}

fn run_pipeline(compiled: &SqlCompiled, mut rows: Vec<PipeRow>) -> Result<Value> {
    let pipeline = &compiled.pipeline;

    // Unique suppression happens at scan level, before residual filters,
    // matching the native execution order.
    if pipeline.unique {
        rows.dedup_by(|a, b| a.head.is_some() && a.head == b.head);
    }
    if !pipeline.filters.is_empty() {
        rows.retain(|row| filters_match(&pipeline.filters, row.record.as_ref()));
    }

    let offset = pipeline.offset.unwrap_or(0) as usize;
    let rows: Vec<PipeRow> = match pipeline.limit {
        Some(limit) => rows.into_iter().skip(offset).take(limit as usize).collect(),
        None => rows.into_iter().skip(offset).collect(),
    };

    match &pipeline.reduce {
        Some(ReduceExpr::Count) => Ok(Value::Number(rows.len() as f64)),
        Some(reduce) => {
            let records: Vec<Value> = rows.into_iter().filter_map(|r| r.record).collect();
            reduce_records(reduce, &records)
        }
        None => {
            let items: Vec<Value> = rows
                .into_iter()
                .map(|row| match (&pipeline.map, row.record) {
                    (Some(map), Some(record)) => apply_map(map, &record),
                    (_, Some(record)) => record,
                    // Key-projection fast path: the head cell is the value.
                    (_, None) => row.head.map(Value::from).unwrap_or(Value::Null),
                })
                .collect();
            Ok(Value::Array(items))
        }
    }
}

/// Convert the one-row aggregate result into the query's value.
fn finalize_aggregate(reduce: Option<&ReduceExpr>, cell: SqlValue) -> Result<Value> {
    Ok(match (reduce, cell) {
        (Some(ReduceExpr::Count), SqlValue::Num(n)) => Value::Number(n),
        (Some(ReduceExpr::Count), _) => Value::Number(0.0),
        (_, SqlValue::Num(n)) => Value::Number(n),
        (_, SqlValue::Key(key)) => Value::from(key),
        (_, SqlValue::Text(text)) => Value::Text(text),
        (_, SqlValue::Null) => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sql::SqlDriver;
    use crate::backend::{Direction, Driver, TxMode};
    use polydb_common::record;
    use polydb_common::schema::{IndexSchema, KeyType};
    use polydb_common::KeyRange;

    fn schema() -> DatabaseSchema {
        DatabaseSchema::fixed(vec![StoreSchema::new("orders")
            .with_key_path("id", KeyType::Number)
            .with_index(IndexSchema::new("k", KeyType::Text))
            .with_index(IndexSchema::new("price", KeyType::Number))])
    }

    fn driver() -> SqlDriver {
        let driver = SqlDriver::new();
        driver.connect("t", &schema()).unwrap();
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

    fn run(driver: &SqlDriver, ir: QueryIr) -> Value {
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
    fn generated_sql_binds_indexed_wheres() {
        let ir = QueryIr::new("orders").with_where(WhereClause::new(
            "price",
            KeyRange::bound(Key::Number(2.0), Key::Number(4.0), false, true),
        ));
        let compiled = compile(&ir, &schema()).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT \"__rec\" FROM \"orders\" WHERE \"ix_price\" >= ? AND \"ix_price\" < ? ORDER BY \"ix_price\" ASC"
        );
        assert_eq!(compiled.params.len(), 2);
        assert!(compiled.pipeline.filters.is_empty());
    }

    #[test]
    fn unique_direction_emits_distinct_on_key_projection() {
        let ir = QueryIr::new("orders")
            .with_index("k")
            .with_direction(Direction::NextUnique)
            .with_map(MapExpr::Field("k".into()));
        let compiled = compile(&ir, &schema()).unwrap();
        assert!(compiled.sql.starts_with("SELECT DISTINCT \"ix_k\""), "{}", compiled.sql);

        let driver = driver();
        assert_eq!(
            run(&driver, ir),
            Value::Array(vec![Value::Text("a".into()), Value::Text("b".into())])
        );
    }

    #[test]
    fn aggregates_lower_to_sql_when_the_field_has_a_column() {
        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Sum("price".into()));
        let compiled = compile(&ir, &schema()).unwrap();
        assert_eq!(compiled.sql, "SELECT SUM(\"ix_price\") FROM \"orders\"");
        assert!(compiled.pipeline.finalize_take_first);

        let driver = driver();
        assert_eq!(run(&driver, ir), Value::Number(10.0));
    }

    #[test]
    fn aggregates_fall_back_to_the_pipeline_without_a_column() {
        // "qty" has no index, so the reduce runs over materialized records.
        let driver = SqlDriver::new();
        driver.connect("t", &schema()).unwrap();
        driver.transaction(
            &["orders".to_string()],
            TxMode::ReadWrite,
            Box::new(|tx| {
                for (id, qty) in [(1, 5.0), (2, 7.0)] {
                    tx.put(
                        "orders",
                        record! { "id" => id as i64, "k" => "x", "price" => 1.0, "qty" => qty },
                        None,
                    )?;
                }
                Ok(Value::Null)
            }),
        );
        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Sum("qty".into()));
        let compiled = compile(&ir, &schema()).unwrap();
        assert!(!compiled.pipeline.finalize_take_first);
        assert_eq!(run(&driver, ir), Value::Number(12.0));
    }

    #[test]
    fn count_lowers_to_sql_count() {
        let driver = driver();
        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Count).with_where(
            WhereClause::new("k", KeyRange::only("a".into())),
        );
        assert_eq!(run(&driver, ir), Value::Number(2.0));
    }

    #[test]
    fn non_indexed_wheres_stay_as_runtime_filters() {
        let ir = QueryIr::new("orders")
            .with_where(WhereClause::new("qty", KeyRange::only(Key::Number(5.0))));
        let compiled = compile(&ir, &schema()).unwrap();
        assert!(!compiled.sql.contains("WHERE"), "{}", compiled.sql);
        assert_eq!(compiled.pipeline.filters.len(), 1);
    }

    #[test]
    fn concat_is_not_implemented_on_sql() {
        let ir = QueryIr::new("orders").with_reduce(ReduceExpr::Concat("k".into()));
        let err = compile(&ir, &schema()).unwrap_err();
        assert_eq!(err.kind(), "not_implemented");
    }

    #[test]
    fn descending_order_with_window() {
        let driver = driver();
        let ir = QueryIr::new("orders")
            .with_index("price")
            .with_direction(Direction::Prev)
            .with_map(MapExpr::Field("id".into()))
            .with_limit(2);
        assert_eq!(
            run(&driver, ir),
            Value::Array(vec![Value::Number(4.0), Value::Number(3.0)])
        );
    }
}
