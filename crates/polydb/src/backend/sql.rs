//! The relational SQL engine.
//!
//! Each store becomes a table with a `__pk` column, one column per indexed
//! field (tuple indexes get one column per component), and a `__rec` column
//! holding the serialized record. Everything flows through the narrow SQL
//! dialect the layer generates: single-table SELECT with comparison
//! predicates combined by `AND` and parenthesized `OR` groups (tuple-key
//! ranges expand lexicographically into the latter), `INSERT [OR
//! REPLACE]`, `DELETE`, `ORDER BY`, `LIMIT`, `OFFSET`, `DISTINCT`, and the
//! standard aggregates. Statements outside that dialect are rejected, not
//! guessed at.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use polydb_common::keyrange::quote_ident;
use polydb_common::schema::SchemaDelta;
use polydb_common::{
    DatabaseSchema, DbError, IndexSchema, Key, KeyRange, KeyType, Result, StoreSchema, Value,
};

use super::{
    index_keys, resolve_primary_key, CursorRow, Driver, Mechanism, ScanPlan, StoreTx, TxClosure,
    TxMode, TxReport,
};
use crate::cursor::SqlCursor;

// Wire types

/// A parameter bound to a generated statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Key(Key),
    /// A serialized record destined for the `__rec` column.
    Record(String),
    Null,
}

/// A single result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Key(Key),
    Num(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_key(&self) -> Option<&Key> {
        match self {
            SqlValue::Key(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Num(n) => Some(*n),
            SqlValue::Key(Key::Number(n)) => Some(*n),
            _ => None,
        }
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow(pub Vec<SqlValue>);

/// The statement surface a relational transaction exposes.
pub trait SqlExecutor {
    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>>;
    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64>;
}

// Column layout

pub(crate) const PK_COL: &str = "__pk";
pub(crate) const REC_COL: &str = "__rec";

pub(crate) fn index_col_base(index_name: &str) -> String {
    format!("ix_{index_name}")
}

/// Column names an index occupies: one, or one per tuple component.
pub(crate) fn index_columns(index: &IndexSchema) -> Vec<String> {
    let base = index_col_base(&index.name);
    match &index.key_type {
        KeyType::Tuple(parts) => (0..parts.len()).map(|i| format!("{base}_{i}")).collect(),
        _ => vec![base],
    }
}

fn table_columns(store: &StoreSchema) -> Vec<String> {
    let mut columns = vec![PK_COL.to_string()];
    for ix in &store.indexes {
        columns.extend(index_columns(ix));
    }
    columns.push(REC_COL.to_string());
    columns
}

pub(crate) fn record_to_sql(record: &Value) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

pub(crate) fn record_from_sql(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

// Storage

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: BTreeMap<Key, HashMap<String, SqlValue>>,
    next_auto: u64,
}

impl Table {
    fn for_schema(store: &StoreSchema) -> Self {
        Table {
            columns: table_columns(store),
            ..Table::default()
        }
    }
}

#[derive(Debug, Default)]
struct SqlState {
    schema: DatabaseSchema,
    tables: HashMap<String, Table>,
}

/// Relational engine driver.
pub struct SqlDriver {
    state: Mutex<SqlState>,
    ready: AtomicBool,
}

impl SqlDriver {
    pub fn new() -> Self {
        SqlDriver {
            state: Mutex::new(SqlState::default()),
            ready: AtomicBool::new(false),
        }
    }
}

impl Default for SqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SqlDriver {
    fn mechanism(&self) -> Mechanism {
        Mechanism::RelationalSql
    }

    fn connect(&self, name: &str, schema: &DatabaseSchema) -> Result<DatabaseSchema> {
        let mut state = self.state.lock();
        let delta = schema.delta_from(&state.schema);
        if !delta.is_empty() {
            tracing::debug!(
                database = name,
                stores = delta.create_stores.len(),
                "relational engine applying schema delta"
            );
        }
        state.schema = schema.clone();
        state.tables.retain(|k, _| schema.has_store(k));
        for store in schema.stores() {
            state
                .tables
                .entry(store.name.clone())
                .or_insert_with(|| Table::for_schema(store));
        }
        self.ready.store(true, AtomicOrdering::SeqCst);
        Ok(schema.clone())
    }

    fn transaction(&self, stores: &[String], mode: TxMode, closure: TxClosure) -> TxReport {
        let mut state = self.state.lock();

        let snapshot: HashMap<String, Table> = match mode {
            TxMode::VersionChange => state.tables.clone(),
            _ => stores
                .iter()
                .filter_map(|name| state.tables.get(name).map(|t| (name.clone(), t.clone())))
                .collect(),
        };
        let schema_snapshot = state.schema.clone();

        let mut tx = SqlTx {
            state: &mut *state,
            scope: stores.to_vec(),
            mode,
            aborted: false,
        };
        let result = closure(&mut tx);
        let aborted = tx.aborted;

        if aborted || result.is_err() {
            if mode == TxMode::VersionChange {
                state.tables = snapshot;
            } else {
                for (name, table) in snapshot {
                    state.tables.insert(name, table);
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

// Transaction

struct SqlTx<'a> {
    state: &'a mut SqlState,
    scope: Vec<String>,
    mode: TxMode,
    aborted: bool,
}

impl SqlTx<'_> {
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

    /// Column cells a record contributes, in table column order.
    fn row_params(
        &mut self,
        schema: &StoreSchema,
        record: &mut Value,
        explicit: Option<Key>,
    ) -> Result<(Vec<String>, Vec<SqlParam>, Key)> {
        let next_auto = {
            let table = self
                .state
                .tables
                .get_mut(&schema.name)
                .ok_or_else(|| DbError::Argument(format!("unknown store '{}'", schema.name)))?;
            &mut table.next_auto
        };
        let pk = resolve_primary_key(schema, record, explicit, next_auto)?;

        let mut columns = vec![PK_COL.to_string()];
        let mut params = vec![SqlParam::Key(pk.clone())];
        for ix in &schema.indexes {
            // The relational layout is single-valued per column; a
            // multi-entry array lands as one tuple key.
            let key = ix.effective_key_path().extract(record)?;
            let cols = index_columns(ix);
            match (key, cols.len()) {
                (Some(Key::Tuple(parts)), n) if n > 1 => {
                    for (col, part) in cols.into_iter().zip(parts) {
                        columns.push(col);
                        params.push(SqlParam::Key(part));
                    }
                }
                (Some(key), _) => {
                    columns.push(cols[0].clone());
                    params.push(SqlParam::Key(key));
                }
                (None, n) => {
                    for col in cols.into_iter().take(n) {
                        columns.push(col);
                        params.push(SqlParam::Null);
                    }
                }
            }
        }
        columns.push(REC_COL.to_string());
        params.push(SqlParam::Record(record_to_sql(record)?));
        Ok((columns, params, pk))
    }

    fn write(
        &mut self,
        store: &str,
        record: Value,
        key: Option<Key>,
        replace: bool,
    ) -> Result<Key> {
        self.check_scope(store)?;
        self.check_writable()?;
        let schema = self.store_schema(store)?;
        let mut record = record;
        let (columns, params, pk) = self.row_params(&schema, &mut record, key)?;

        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let sql = format!(
            "{verb} INTO {} ({}) VALUES ({})",
            quote_ident(store),
            column_list.join(", "),
            placeholders.join(", "),
        );
        self.execute(&sql, &params)?;
        Ok(pk)
    }
}

impl StoreTx for SqlTx<'_> {
    fn mechanism(&self) -> Mechanism {
        Mechanism::RelationalSql
    }

    fn mode(&self) -> TxMode {
        self.mode
    }

    fn schema(&self) -> DatabaseSchema {
        self.state.schema.clone()
    }

    fn put(&mut self, store: &str, record: Value, key: Option<Key>) -> Result<Key> {
        self.write(store, record, key, true)
    }

    fn add(&mut self, store: &str, record: Value, key: Option<Key>) -> Result<Key> {
        self.write(store, record, key, false)
    }

    fn get(&mut self, store: &str, key: &Key) -> Result<Option<Value>> {
        self.check_scope(store)?;
        self.store_schema(store)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote_ident(REC_COL),
            quote_ident(store),
            quote_ident(PK_COL),
        );
        let rows = self.query(&sql, &[SqlParam::Key(key.clone())])?;
        match rows.first().and_then(|row| row.0.first()) {
            Some(SqlValue::Text(text)) => Ok(Some(record_from_sql(text)?)),
            _ => Ok(None),
        }
    }

    fn delete(&mut self, store: &str, key: &Key) -> Result<u64> {
        self.check_scope(store)?;
        self.check_writable()?;
        self.store_schema(store)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(store),
            quote_ident(PK_COL),
        );
        self.execute(&sql, &[SqlParam::Key(key.clone())])
    }

    fn delete_range(&mut self, store: &str, range: &KeyRange) -> Result<u64> {
        self.check_scope(store)?;
        self.check_writable()?;
        self.store_schema(store)?;
        let fragment = range.to_sql(PK_COL);
        let sql = if fragment.is_empty() {
            format!("DELETE FROM {}", quote_ident(store))
        } else {
            format!("DELETE FROM {} WHERE {}", quote_ident(store), fragment.sql)
        };
        let params: Vec<SqlParam> = fragment.params.into_iter().map(SqlParam::Key).collect();
        self.execute(&sql, &params)
    }

    fn clear_store(&mut self, store: &str) -> Result<()> {
        self.check_scope(store)?;
        self.check_writable()?;
        self.store_schema(store)?;
        self.execute(&format!("DELETE FROM {}", quote_ident(store)), &[])?;
        Ok(())
    }

    fn count(&mut self, store: &str, range: Option<&KeyRange>) -> Result<u64> {
        self.check_scope(store)?;
        self.store_schema(store)?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(store));
        let mut params = Vec::new();
        if let Some(range) = range {
            let fragment = range.to_sql(PK_COL);
            if !fragment.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&fragment.sql);
                params.extend(fragment.params.into_iter().map(SqlParam::Key));
            }
        }
        let rows = self.query(&sql, &params)?;
        Ok(rows
            .first()
            .and_then(|row| row.0.first())
            .and_then(SqlValue::as_f64)
            .unwrap_or(0.0) as u64)
    }

    fn scan(&mut self, plan: &ScanPlan) -> Result<Vec<CursorRow>> {
        self.check_scope(&plan.store)?;
        let schema = self.store_schema(&plan.store)?;
        let cursor = SqlCursor::open(self, &schema, plan)?;
        Ok(cursor.into_rows())
    }

    fn sql(&mut self) -> Option<&mut dyn SqlExecutor> {
        Some(self)
    }

    fn apply_delta(&mut self, delta: &SchemaDelta) -> Result<()> {
        if self.mode != TxMode::VersionChange {
            return Err(DbError::InvalidOperation(
                "schema changes require a version-change transaction".into(),
            ));
        }
        for store in &delta.create_stores {
            self.state
                .tables
                .entry(store.name.clone())
                .or_insert_with(|| Table::for_schema(store));
            self.state.schema.upgrade_store(store.clone());
        }
        for (store_name, ix) in &delta.create_indexes {
            let mut schema = self
                .state
                .schema
                .store(store_name)
                .cloned()
                .ok_or_else(|| DbError::Argument(format!("unknown store '{store_name}'")))?;
            schema.indexes.retain(|existing| existing.name != ix.name);
            schema.indexes.push(ix.clone());

            let table = self
                .state
                .tables
                .get_mut(store_name)
                .ok_or_else(|| DbError::Internal(format!("no table for '{store_name}'")))?;
            table.columns = table_columns(&schema);
            // Backfill the new column(s) from stored records.
            let pks: Vec<Key> = table.rows.keys().cloned().collect();
            for pk in pks {
                let record = match table.rows.get(&pk).and_then(|cells| cells.get(REC_COL)) {
                    Some(SqlValue::Text(text)) => record_from_sql(text)?,
                    _ => continue,
                };
                let keys = index_keys(ix, &record)?;
                let cols = index_columns(ix);
                let Some(cells) = table.rows.get_mut(&pk) else {
                    continue;
                };
                match keys.first() {
                    Some(Key::Tuple(parts)) if cols.len() > 1 => {
                        for (col, part) in cols.iter().zip(parts) {
                            cells.insert(col.clone(), SqlValue::Key(part.clone()));
                        }
                    }
                    Some(key) => {
                        cells.insert(cols[0].clone(), SqlValue::Key(key.clone()));
                    }
                    None => {}
                }
            }
            self.state.schema.upgrade_store(schema);
        }
        for (store_name, ix_name) in &delta.drop_indexes {
            if let Some(mut schema) = self.state.schema.store(store_name).cloned() {
                schema.indexes.retain(|existing| &existing.name != ix_name);
                if let Some(table) = self.state.tables.get_mut(store_name) {
                    let base = index_col_base(ix_name);
                    table.columns = table_columns(&schema);
                    for cells in table.rows.values_mut() {
                        cells.retain(|col, _| col != &base && !col.starts_with(&format!("{base}_")));
                    }
                }
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

impl SqlExecutor for SqlTx<'_> {
    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>> {
        let statement = parse_statement(sql)?;
        match statement {
            Statement::Select(select) => {
                self.check_scope(&select.table)?;
                run_select(self.state, &select, params)
            }
            _ => Err(DbError::SqlParse(format!(
                "expected a SELECT statement, got: {sql}"
            ))),
        }
    }

    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        self.check_writable()?;
        let statement = parse_statement(sql)?;
        match statement {
            Statement::Insert(insert) => {
                self.check_scope(&insert.table)?;
                run_insert(self.state, &insert, params)
            }
            Statement::Delete(delete) => {
                self.check_scope(&delete.table)?;
                run_delete(self.state, &delete, params)
            }
            Statement::Select(_) => Err(DbError::SqlParse(format!(
                "SELECT passed to execute: {sql}"
            ))),
        }
    }
}

// Dialect parsing

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Quoted(String),
    Num(f64),
    Param,
    LParen,
    RParen,
    Comma,
    Star,
    Op(&'static str),
}

fn tokenize(sql: &str) -> Result<Vec<Tok>> {
    let bytes = sql.as_bytes();
    let mut toks = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let b = bytes[pos];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'"' => {
                let mut ident = String::new();
                pos += 1;
                loop {
                    match bytes.get(pos) {
                        Some(b'"') if bytes.get(pos + 1) == Some(&b'"') => {
                            ident.push('"');
                            pos += 2;
                        }
                        Some(b'"') => {
                            pos += 1;
                            break;
                        }
                        Some(&c) => {
                            ident.push(c as char);
                            pos += 1;
                        }
                        None => {
                            return Err(DbError::SqlParse(format!(
                                "unterminated identifier in: {sql}"
                            )));
                        }
                    }
                }
                toks.push(Tok::Quoted(ident));
            }
            b'?' => {
                toks.push(Tok::Param);
                pos += 1;
            }
            b'(' => {
                toks.push(Tok::LParen);
                pos += 1;
            }
            b')' => {
                toks.push(Tok::RParen);
                pos += 1;
            }
            b',' => {
                toks.push(Tok::Comma);
                pos += 1;
            }
            b'*' => {
                toks.push(Tok::Star);
                pos += 1;
            }
            b'=' => {
                toks.push(Tok::Op("="));
                pos += 1;
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    toks.push(Tok::Op("<="));
                    pos += 2;
                } else {
                    toks.push(Tok::Op("<"));
                    pos += 1;
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    toks.push(Tok::Op(">="));
                    pos += 2;
                } else {
                    toks.push(Tok::Op(">"));
                    pos += 1;
                }
            }
            b'0'..=b'9' => {
                let start = pos;
                while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                    pos += 1;
                }
                let text = &sql[start..pos];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| DbError::SqlParse(format!("bad number '{text}'")))?;
                toks.push(Tok::Num(n));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                toks.push(Tok::Ident(sql[start..pos].to_string()));
            }
            other => {
                return Err(DbError::SqlParse(format!(
                    "unexpected character '{}' in: {sql}",
                    other as char
                )));
            }
        }
    }
    Ok(toks)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn matches(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        matches!(
            (self, ordering),
            (CmpOp::Eq, Equal)
                | (CmpOp::Lt, Less)
                | (CmpOp::Le, Less | Equal)
                | (CmpOp::Gt, Greater)
                | (CmpOp::Ge, Greater | Equal)
        )
    }
}

#[derive(Debug, Clone)]
struct Cond {
    column: String,
    op: CmpOp,
    param: usize,
}

/// A parsed WHERE tree: comparisons joined by AND, with parenthesized OR
/// groups for the lexicographic tuple-range expansions.
#[derive(Debug, Clone)]
enum WhereExpr {
    Cond(Cond),
    And(Vec<WhereExpr>),
    Or(Vec<WhereExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AggFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone)]
enum Projection {
    All,
    Columns(Vec<String>),
    Aggregate(AggFn, Option<String>),
}

#[derive(Debug)]
struct Select {
    distinct: bool,
    projection: Projection,
    table: String,
    filter: Option<WhereExpr>,
    order_by: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

#[derive(Debug)]
struct Insert {
    table: String,
    replace: bool,
    columns: Vec<String>,
}

#[derive(Debug)]
struct Delete {
    table: String,
    filter: Option<WhereExpr>,
}

#[derive(Debug)]
enum Statement {
    Select(Select),
    Insert(Insert),
    Delete(Delete),
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    params_seen: usize,
    source: String,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> DbError {
        DbError::SqlParse(format!("{} in: {}", message.into(), self.source))
    }

    fn keyword(&mut self, word: &str) -> bool {
        if let Some(Tok::Ident(id)) = self.peek()
            && id.eq_ignore_ascii_case(word)
        {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.keyword(word) {
            Ok(())
        } else {
            Err(self.error(format!("expected {word}")))
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.next() {
            Some(Tok::Quoted(name)) | Some(Tok::Ident(name)) => Ok(name),
            other => Err(self.error(format!("expected identifier, found {other:?}"))),
        }
    }

    fn expect_param(&mut self) -> Result<usize> {
        match self.next() {
            Some(Tok::Param) => {
                let idx = self.params_seen;
                self.params_seen += 1;
                Ok(idx)
            }
            other => Err(self.error(format!("expected parameter, found {other:?}"))),
        }
    }

    fn expect_integer(&mut self) -> Result<u64> {
        match self.next() {
            Some(Tok::Num(n)) if n >= 0.0 && n.fract() == 0.0 => Ok(n as u64),
            other => Err(self.error(format!("expected integer, found {other:?}"))),
        }
    }

    fn parse_where_expr(&mut self) -> Result<WhereExpr> {
        let mut terms = vec![self.parse_and_expr()?];
        while self.keyword("OR") {
            terms.push(self.parse_and_expr()?);
        }
        if terms.len() == 1 {
            Ok(terms.remove(0))
        } else {
            Ok(WhereExpr::Or(terms))
        }
    }

    fn parse_and_expr(&mut self) -> Result<WhereExpr> {
        let mut terms = vec![self.parse_where_atom()?];
        while self.keyword("AND") {
            terms.push(self.parse_where_atom()?);
        }
        if terms.len() == 1 {
            Ok(terms.remove(0))
        } else {
            Ok(WhereExpr::And(terms))
        }
    }

    fn parse_where_atom(&mut self) -> Result<WhereExpr> {
        if matches!(self.peek(), Some(Tok::LParen)) {
            self.pos += 1;
            let expr = self.parse_where_expr()?;
            if !matches!(self.next(), Some(Tok::RParen)) {
                return Err(self.error("expected ) in WHERE"));
            }
            return Ok(expr);
        }
        let column = self.expect_name()?;
        let op = match self.next() {
            Some(Tok::Op("=")) => CmpOp::Eq,
            Some(Tok::Op("<")) => CmpOp::Lt,
            Some(Tok::Op("<=")) => CmpOp::Le,
            Some(Tok::Op(">")) => CmpOp::Gt,
            Some(Tok::Op(">=")) => CmpOp::Ge,
            other => return Err(self.error(format!("expected comparison, found {other:?}"))),
        };
        let param = self.expect_param()?;
        Ok(WhereExpr::Cond(Cond { column, op, param }))
    }

    fn parse_select(&mut self) -> Result<Select> {
        let distinct = self.keyword("DISTINCT");
        let projection = self.parse_projection()?;
        self.expect_keyword("FROM")?;
        let table = self.expect_name()?;

        let filter = if self.keyword("WHERE") {
            Some(self.parse_where_expr()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let column = self.expect_name()?;
                let desc = if self.keyword("DESC") {
                    true
                } else {
                    self.keyword("ASC");
                    false
                };
                order_by.push((column, desc));
                if !matches!(self.peek(), Some(Tok::Comma)) {
                    break;
                }
                self.pos += 1;
            }
        }

        let limit = if self.keyword("LIMIT") {
            Some(self.expect_integer()?)
        } else {
            None
        };
        let offset = if self.keyword("OFFSET") {
            Some(self.expect_integer()?)
        } else {
            None
        };

        if self.peek().is_some() {
            return Err(self.error("trailing tokens"));
        }
        Ok(Select {
            distinct,
            projection,
            table,
            filter,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_projection(&mut self) -> Result<Projection> {
        if matches!(self.peek(), Some(Tok::Star)) {
            self.pos += 1;
            return Ok(Projection::All);
        }

        // Aggregate: IDENT '(' col | '*' ')'
        if let Some(Tok::Ident(id)) = self.peek() {
            let agg = match id.to_ascii_uppercase().as_str() {
                "COUNT" => Some(AggFn::Count),
                "SUM" => Some(AggFn::Sum),
                "AVG" => Some(AggFn::Avg),
                "MIN" => Some(AggFn::Min),
                "MAX" => Some(AggFn::Max),
                _ => None,
            };
            if let Some(agg) = agg {
                self.pos += 1;
                if !matches!(self.next(), Some(Tok::LParen)) {
                    return Err(self.error("expected ( after aggregate"));
                }
                let column = if matches!(self.peek(), Some(Tok::Star)) {
                    self.pos += 1;
                    None
                } else {
                    Some(self.expect_name()?)
                };
                if !matches!(self.next(), Some(Tok::RParen)) {
                    return Err(self.error("expected ) after aggregate"));
                }
                return Ok(Projection::Aggregate(agg, column));
            }
        }

        let mut columns = vec![self.expect_name()?];
        while matches!(self.peek(), Some(Tok::Comma)) {
            self.pos += 1;
            columns.push(self.expect_name()?);
        }
        Ok(Projection::Columns(columns))
    }

    fn parse_insert(&mut self) -> Result<Insert> {
        let replace = if self.keyword("OR") {
            self.expect_keyword("REPLACE")?;
            true
        } else {
            false
        };
        self.expect_keyword("INTO")?;
        let table = self.expect_name()?;

        if !matches!(self.next(), Some(Tok::LParen)) {
            return Err(self.error("expected column list"));
        }
        let mut columns = vec![self.expect_name()?];
        while matches!(self.peek(), Some(Tok::Comma)) {
            self.pos += 1;
            columns.push(self.expect_name()?);
        }
        if !matches!(self.next(), Some(Tok::RParen)) {
            return Err(self.error("expected ) after columns"));
        }

        self.expect_keyword("VALUES")?;
        if !matches!(self.next(), Some(Tok::LParen)) {
            return Err(self.error("expected ( before values"));
        }
        let mut count = 0;
        loop {
            self.expect_param()?;
            count += 1;
            match self.next() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => break,
                other => return Err(self.error(format!("expected , or ), found {other:?}"))),
            }
        }
        if count != columns.len() {
            return Err(self.error("value count does not match column count"));
        }
        if self.peek().is_some() {
            return Err(self.error("trailing tokens"));
        }
        Ok(Insert {
            table,
            replace,
            columns,
        })
    }

    fn parse_delete(&mut self) -> Result<Delete> {
        self.expect_keyword("FROM")?;
        let table = self.expect_name()?;
        let filter = if self.keyword("WHERE") {
            Some(self.parse_where_expr()?)
        } else {
            None
        };
        if self.peek().is_some() {
            return Err(self.error("trailing tokens"));
        }
        Ok(Delete { table, filter })
    }
}

fn parse_statement(sql: &str) -> Result<Statement> {
    let mut parser = Parser {
        toks: tokenize(sql)?,
        pos: 0,
        params_seen: 0,
        source: sql.to_string(),
    };
    if parser.keyword("SELECT") {
        parser.parse_select().map(Statement::Select)
    } else if parser.keyword("INSERT") {
        parser.parse_insert().map(Statement::Insert)
    } else if parser.keyword("DELETE") {
        parser.parse_delete().map(Statement::Delete)
    } else {
        Err(DbError::SqlParse(format!(
            "unsupported statement: {sql}"
        )))
    }
}

// Evaluation

fn param_key(params: &[SqlParam], idx: usize, sql_ctx: &str) -> Result<Key> {
    match params.get(idx) {
        Some(SqlParam::Key(key)) => Ok(key.clone()),
        Some(other) => Err(DbError::Argument(format!(
            "parameter {idx} is not a key ({other:?}) for {sql_ctx}"
        ))),
        None => Err(DbError::Argument(format!(
            "missing parameter {idx} for {sql_ctx}"
        ))),
    }
}

fn eval_where(
    cells: &HashMap<String, SqlValue>,
    expr: &WhereExpr,
    params: &[SqlParam],
) -> Result<bool> {
    match expr {
        WhereExpr::Cond(cond) => {
            let bound = param_key(params, cond.param, "WHERE clause")?;
            let cell = match cells.get(&cond.column) {
                Some(SqlValue::Key(key)) => key,
                // NULL never satisfies a comparison.
                _ => return Ok(false),
            };
            Ok(cond.op.matches(cell.cmp(&bound)))
        }
        WhereExpr::And(terms) => {
            for term in terms {
                if !eval_where(cells, term, params)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        WhereExpr::Or(terms) => {
            for term in terms {
                if eval_where(cells, term, params)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn row_matches(
    cells: &HashMap<String, SqlValue>,
    filter: Option<&WhereExpr>,
    params: &[SqlParam],
) -> Result<bool> {
    match filter {
        Some(expr) => eval_where(cells, expr, params),
        None => Ok(true),
    }
}

fn run_select(state: &SqlState, select: &Select, params: &[SqlParam]) -> Result<Vec<SqlRow>> {
    let table = state
        .tables
        .get(&select.table)
        .ok_or_else(|| DbError::Argument(format!("no such table '{}'", select.table)))?;

    let mut matched: Vec<&HashMap<String, SqlValue>> = Vec::new();
    for cells in table.rows.values() {
        if row_matches(cells, select.filter.as_ref(), params)? {
            matched.push(cells);
        }
    }

    if !select.order_by.is_empty() {
        matched.sort_by(|a, b| {
            for (column, desc) in &select.order_by {
                let av = a.get(column).and_then(SqlValue::as_key);
                let bv = b.get(column).and_then(SqlValue::as_key);
                let ordering = match (av, bv) {
                    (Some(ak), Some(bk)) => ak.cmp(bk),
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                let ordering = if *desc { ordering.reverse() } else { ordering };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    if let Projection::Aggregate(agg, column) = &select.projection {
        return Ok(vec![run_aggregate(*agg, column.as_deref(), &matched)]);
    }

    let columns: Vec<String> = match &select.projection {
        Projection::All => table.columns.clone(),
        Projection::Columns(cols) => cols.clone(),
        Projection::Aggregate(..) => unreachable!(),
    };

    let mut rows: Vec<SqlRow> = matched
        .into_iter()
        .map(|cells| {
            SqlRow(
                columns
                    .iter()
                    .map(|col| cells.get(col).cloned().unwrap_or(SqlValue::Null))
                    .collect(),
            )
        })
        .collect();

    if select.distinct {
        let mut seen = Vec::new();
        rows.retain(|row| {
            if seen.contains(row) {
                false
            } else {
                seen.push(row.clone());
                true
            }
        });
    }

    let offset = select.offset.unwrap_or(0) as usize;
    let rows = rows.into_iter().skip(offset);
    let rows = match select.limit {
        Some(limit) => rows.take(limit as usize).collect(),
        None => rows.collect(),
    };
    Ok(rows)
}

fn run_aggregate(
    agg: AggFn,
    column: Option<&str>,
    matched: &[&HashMap<String, SqlValue>],
) -> SqlRow {
    let values = || {
        matched.iter().filter_map(|cells| {
            column
                .and_then(|col| cells.get(col))
                .filter(|v| !matches!(v, SqlValue::Null))
        })
    };
    let cell = match agg {
        AggFn::Count => {
            let n = match column {
                Some(_) => values().count(),
                None => matched.len(),
            };
            SqlValue::Num(n as f64)
        }
        AggFn::Sum => SqlValue::Num(values().filter_map(SqlValue::as_f64).sum()),
        AggFn::Avg => {
            let nums: Vec<f64> = values().filter_map(SqlValue::as_f64).collect();
            if nums.is_empty() {
                SqlValue::Null
            } else {
                SqlValue::Num(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggFn::Min => values()
            .filter_map(SqlValue::as_key)
            .min()
            .map(|k| SqlValue::Key(k.clone()))
            .unwrap_or(SqlValue::Null),
        AggFn::Max => values()
            .filter_map(SqlValue::as_key)
            .max()
            .map(|k| SqlValue::Key(k.clone()))
            .unwrap_or(SqlValue::Null),
    };
    SqlRow(vec![cell])
}

fn run_insert(state: &mut SqlState, insert: &Insert, params: &[SqlParam]) -> Result<u64> {
    let schema = state
        .schema
        .store(&insert.table)
        .cloned()
        .ok_or_else(|| DbError::Argument(format!("no such table '{}'", insert.table)))?;
    let table = state
        .tables
        .get_mut(&insert.table)
        .ok_or_else(|| DbError::Argument(format!("no such table '{}'", insert.table)))?;

    let mut cells = HashMap::new();
    for (i, column) in insert.columns.iter().enumerate() {
        let cell = match params.get(i) {
            Some(SqlParam::Key(key)) => SqlValue::Key(key.clone()),
            Some(SqlParam::Record(text)) => SqlValue::Text(text.clone()),
            Some(SqlParam::Null) => SqlValue::Null,
            None => return Err(DbError::Argument(format!("missing parameter {i}"))),
        };
        cells.insert(column.clone(), cell);
    }

    let pk = match cells.get(PK_COL) {
        Some(SqlValue::Key(key)) => key.clone(),
        _ => {
            return Err(DbError::Argument(format!(
                "INSERT into '{}' has no primary key column",
                insert.table
            )));
        }
    };

    // A tuple primary key also materializes component cells, so range
    // fragments projected over `__pk_0`, `__pk_1`, ... can bind.
    if let Key::Tuple(parts) = &pk {
        for (i, part) in parts.iter().enumerate() {
            cells.insert(format!("{PK_COL}_{i}"), SqlValue::Key(part.clone()));
        }
    }

    if !insert.replace && table.rows.contains_key(&pk) {
        return Err(DbError::Constraint(format!(
            "key {pk} already exists in store '{}'",
            insert.table
        )));
    }

    // Unique index enforcement across the other rows.
    for ix in schema.indexes.iter().filter(|ix| ix.unique) {
        let cols = index_columns(ix);
        let new_vals: Vec<Option<&SqlValue>> = cols.iter().map(|c| cells.get(c)).collect();
        if new_vals
            .iter()
            .any(|v| !matches!(v, Some(SqlValue::Key(_))))
        {
            continue;
        }
        for (other_pk, other) in &table.rows {
            if *other_pk == pk {
                continue;
            }
            let same = cols
                .iter()
                .zip(&new_vals)
                .all(|(col, new_val)| other.get(col) == *new_val);
            if same {
                return Err(DbError::Constraint(format!(
                    "unique index '{}' violated in store '{}'",
                    ix.name, insert.table
                )));
            }
        }
    }

    table.rows.insert(pk, cells);
    Ok(1)
}

fn run_delete(state: &mut SqlState, delete: &Delete, params: &[SqlParam]) -> Result<u64> {
    let table = state
        .tables
        .get_mut(&delete.table)
        .ok_or_else(|| DbError::Argument(format!("no such table '{}'", delete.table)))?;

    let doomed: Vec<Key> = table
        .rows
        .iter()
        .filter_map(|(pk, cells)| {
            match row_matches(cells, delete.filter.as_ref(), params) {
                Ok(true) => Some(pk.clone()),
                _ => None,
            }
        })
        .collect();
    let removed = doomed.len() as u64;
    for pk in doomed {
        table.rows.remove(&pk);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::super::TxKind;
    use super::*;
    use polydb_common::record;

    fn driver() -> SqlDriver {
        let schema = DatabaseSchema::fixed(vec![StoreSchema::new("st")
            .with_key_path("id", KeyType::Number)
            .with_index(IndexSchema::new("k", KeyType::Text))]);
        let driver = SqlDriver::new();
        driver.connect("t", &schema).unwrap();
        driver
    }

    fn run(
        driver: &SqlDriver,
        mode: TxMode,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<Value> + Send + 'static,
    ) -> TxReport {
        driver.transaction(&["st".to_string()], mode, Box::new(f))
    }

    fn seed(driver: &SqlDriver) {
        let report = run(driver, TxMode::ReadWrite, |tx| {
            tx.put("st", record! { "id" => 1i64, "k" => "a" }, None)?;
            tx.put("st", record! { "id" => 2i64, "k" => "a" }, None)?;
            tx.put("st", record! { "id" => 3i64, "k" => "b" }, None)?;
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Complete);
    }

    #[test]
    fn crud_round_trips_through_generated_sql() {
        let driver = driver();
        seed(&driver);
        let report = run(&driver, TxMode::ReadWrite, |tx| {
            let rec = tx.get("st", &Key::Number(2.0))?.unwrap();
            assert_eq!(rec.get_path("k"), Some(&Value::Text("a".into())));
            assert_eq!(tx.delete("st", &Key::Number(2.0))?, 1);
            assert_eq!(tx.delete("st", &Key::Number(2.0))?, 0);
            assert_eq!(tx.count("st", None)?, 2);
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Complete);
    }

    #[test]
    fn add_fails_on_duplicate_key() {
        let driver = driver();
        seed(&driver);
        let report = run(&driver, TxMode::ReadWrite, |tx| {
            tx.add("st", record! { "id" => 1i64, "k" => "z" }, None)?;
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Error);
        assert_eq!(report.result.unwrap_err().kind(), "constraint_error");
    }

    #[test]
    fn raw_select_orders_and_limits() {
        let driver = driver();
        seed(&driver);
        let report = run(&driver, TxMode::ReadOnly, |tx| {
            let exec = tx.sql().expect("relational backend exposes SQL");
            let rows = exec.query(
                "SELECT \"__pk\" FROM \"st\" ORDER BY \"ix_k\" DESC, \"__pk\" DESC LIMIT 2",
                &[],
            )?;
            let pks: Vec<f64> = rows
                .iter()
                .filter_map(|r| r.0.first().and_then(SqlValue::as_f64))
                .collect();
            assert_eq!(pks, vec![3.0, 2.0]);
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Complete);
    }

    #[test]
    fn where_or_groups_evaluate_short_circuit() {
        let driver = driver();
        seed(&driver);
        let report = run(&driver, TxMode::ReadOnly, |tx| {
            let exec = tx.sql().unwrap();
            // The shape a lexicographic tuple expansion generates: match
            // rows past ("a", 1) in (index key, primary key) order.
            let rows = exec.query(
                "SELECT \"__pk\" FROM \"st\" \
                 WHERE ((\"ix_k\" > ?) OR (\"ix_k\" = ? AND \"__pk\" > ?)) \
                 ORDER BY \"ix_k\" ASC, \"__pk\" ASC",
                &[
                    SqlParam::Key(Key::Text("a".into())),
                    SqlParam::Key(Key::Text("a".into())),
                    SqlParam::Key(Key::Number(1.0)),
                ],
            )?;
            let pks: Vec<f64> = rows
                .iter()
                .filter_map(|r| r.0.first().and_then(SqlValue::as_f64))
                .collect();
            assert_eq!(pks, vec![2.0, 3.0]);
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Complete);
    }

    #[test]
    fn distinct_suppresses_duplicate_index_keys() {
        let driver = driver();
        seed(&driver);
        run(&driver, TxMode::ReadOnly, |tx| {
            let exec = tx.sql().unwrap();
            let rows = exec.query(
                "SELECT DISTINCT \"ix_k\" FROM \"st\" ORDER BY \"ix_k\"",
                &[],
            )?;
            assert_eq!(rows.len(), 2);
            Ok(Value::Null)
        })
        .result
        .unwrap();
    }

    #[test]
    fn aggregates_return_one_row() {
        let driver = driver();
        seed(&driver);
        run(&driver, TxMode::ReadOnly, |tx| {
            let exec = tx.sql().unwrap();
            let count = exec.query("SELECT COUNT(*) FROM \"st\"", &[])?;
            assert_eq!(count[0].0[0], SqlValue::Num(3.0));

            let sum = exec.query("SELECT SUM(\"__pk\") FROM \"st\"", &[])?;
            assert_eq!(sum[0].0[0], SqlValue::Num(6.0));

            let max = exec.query("SELECT MAX(\"ix_k\") FROM \"st\"", &[])?;
            assert_eq!(max[0].0[0], SqlValue::Key(Key::Text("b".into())));
            Ok(Value::Null)
        })
        .result
        .unwrap();
    }

    #[test]
    fn statements_outside_the_dialect_are_rejected() {
        let driver = driver();
        let report = run(&driver, TxMode::ReadOnly, |tx| {
            let exec = tx.sql().unwrap();
            let err = exec
                .query("SELECT * FROM \"st\" JOIN \"other\"", &[])
                .unwrap_err();
            assert_eq!(err.kind(), "sql_parse_error");
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Complete);
    }

    #[test]
    fn writes_are_rejected_in_read_only_mode() {
        let driver = driver();
        let report = run(&driver, TxMode::ReadOnly, |tx| {
            tx.put("st", record! { "id" => 9i64, "k" => "x" }, None)?;
            Ok(Value::Null)
        });
        assert_eq!(report.kind, TxKind::Error);
        assert_eq!(report.result.unwrap_err().kind(), "invalid_operation");
    }
}
