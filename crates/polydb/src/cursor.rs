//! Positioned cursor over a materialized SQL result set.
//!
//! Emulates native index-cursor semantics on the relational backend: one
//! SELECT materializes the ordered rows, then the cursor seeks over them
//! with `advance`, continue-by-key, in-place `update`/`clear`, and
//! `restart`. The cursor borrows the transaction's SQL executor for its
//! whole lifetime, so it cannot outlive the transaction that opened it.

use std::cmp::Ordering;

use polydb_common::keyrange::quote_ident;
use polydb_common::{DbError, Key, KeyRange, Result, StoreSchema, Value};

use crate::backend::sql::{
    index_col_base, index_columns, record_from_sql, record_to_sql, SqlExecutor, SqlParam,
    SqlValue, PK_COL, REC_COL,
};
use crate::backend::{CursorRow, Direction, ScanPlan};

/// Seekable forward/reverse iterator over one materialized result set.
pub struct SqlCursor<'tx> {
    exec: &'tx mut dyn SqlExecutor,
    store: StoreSchema,
    index: Option<String>,
    range: Option<KeyRange>,
    direction: Direction,
    key_only: bool,
    rows: Vec<CursorRow>,
    pos: usize,
}

impl<'tx> SqlCursor<'tx> {
    /// Issue the scan statement and position at the first row.
    pub fn open(
        exec: &'tx mut dyn SqlExecutor,
        store: &StoreSchema,
        plan: &ScanPlan,
    ) -> Result<Self> {
        if let Some(index) = &plan.index
            && store.index(index).is_none()
        {
            return Err(DbError::Argument(format!(
                "store '{}' has no index '{index}'",
                store.name
            )));
        }
        let mut cursor = SqlCursor {
            exec,
            store: store.clone(),
            index: plan.index.clone(),
            range: plan.range.clone(),
            direction: plan.direction,
            key_only: plan.key_only,
            rows: Vec::new(),
            pos: 0,
        };
        cursor.materialize()?;
        Ok(cursor)
    }

    /// Re-issue the statement for the current range and reset the position.
    fn materialize(&mut self) -> Result<()> {
        let eff_base = match &self.index {
            Some(name) => index_col_base(name),
            None => PK_COL.to_string(),
        };
        let eff_cols: Vec<String> = match self.index.as_deref().and_then(|n| self.store.index(n)) {
            Some(ix) => index_columns(ix),
            None => vec![PK_COL.to_string()],
        };

        let mut columns: Vec<String> = eff_cols.clone();
        if self.index.is_some() {
            columns.push(PK_COL.to_string());
        }
        if !self.key_only {
            columns.push(REC_COL.to_string());
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            quote_ident(&self.store.name),
        );

        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(range) = &self.range {
            let fragment = range.to_sql(&eff_base);
            if !fragment.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&fragment.sql);
                params.extend(fragment.params.into_iter().map(SqlParam::Key));
            }
        }

        let dir = if self.direction.is_reverse() {
            "DESC"
        } else {
            "ASC"
        };
        let mut order: Vec<String> = eff_cols.iter().map(|c| format!("{} {dir}", quote_ident(c))).collect();
        if self.index.is_some() {
            order.push(format!("{} {dir}", quote_ident(PK_COL)));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));

        let raw = self.exec.query(&sql, &params)?;

        let eff_n = eff_cols.len();
        let mut rows = Vec::with_capacity(raw.len());
        for row in raw {
            let cells = row.0;
            // Rows without a value at the indexed path are not index
            // entries; their effective cells come back NULL.
            if cells[..eff_n].iter().any(|c| matches!(c, SqlValue::Null)) {
                continue;
            }
            let effective_key = if eff_n == 1 {
                match &cells[0] {
                    SqlValue::Key(k) => k.clone(),
                    other => {
                        return Err(DbError::Internal(format!(
                            "non-key effective cell: {other:?}"
                        )));
                    }
                }
            } else {
                let mut parts = Vec::with_capacity(eff_n);
                for cell in &cells[..eff_n] {
                    match cell {
                        SqlValue::Key(k) => parts.push(k.clone()),
                        other => {
                            return Err(DbError::Internal(format!(
                                "non-key effective cell: {other:?}"
                            )));
                        }
                    }
                }
                Key::Tuple(parts)
            };

            let mut next = eff_n;
            let primary_key = if self.index.is_some() {
                let pk = match &cells[next] {
                    SqlValue::Key(k) => k.clone(),
                    other => {
                        return Err(DbError::Internal(format!("non-key pk cell: {other:?}")));
                    }
                };
                next += 1;
                pk
            } else {
                effective_key.clone()
            };

            let value = if self.key_only {
                None
            } else {
                match cells.get(next) {
                    Some(SqlValue::Text(text)) => Some(record_from_sql(text)?),
                    _ => None,
                }
            };

            rows.push(CursorRow {
                primary_key,
                effective_key,
                value,
            });
        }

        self.rows = rows;
        self.pos = 0;
        Ok(())
    }

    // Position accessors

    /// True iff the position is active (not exhausted).
    pub fn has_cursor(&self) -> bool {
        self.pos < self.rows.len()
    }

    fn current(&self) -> Option<&CursorRow> {
        self.rows.get(self.pos)
    }

    pub fn primary_key(&self) -> Option<&Key> {
        self.current().map(|r| &r.primary_key)
    }

    pub fn index_key(&self) -> Option<&Key> {
        self.current().map(|r| &r.effective_key)
    }

    pub fn value(&self) -> Option<&Value> {
        self.current().and_then(|r| r.value.as_ref())
    }

    pub fn row(&self) -> Option<&CursorRow> {
        self.current()
    }

    /// Whether `candidate` is strictly ahead of `reference` in the cursor's
    /// travel direction.
    fn is_ahead(&self, candidate: &Key, reference: &Key) -> bool {
        match candidate.cmp(reference) {
            Ordering::Greater => !self.direction.is_reverse(),
            Ordering::Less => self.direction.is_reverse(),
            Ordering::Equal => false,
        }
    }

    // Seeking

    /// Move forward `n` positions. `n` must be at least 1.
    pub fn advance(&mut self, n: u32) -> Result<()> {
        if n == 0 {
            return Err(DbError::Argument("advance requires a step of at least 1".into()));
        }
        self.pos = self.pos.saturating_add(n as usize).min(self.rows.len());
        Ok(())
    }

    /// Advance until the effective key reaches or passes `key`.
    pub fn continue_effective_key(&mut self, key: &Key) -> Result<()> {
        let Some(current) = self.index_key().cloned() else {
            return Err(DbError::InvalidOperation(
                "cursor is not active".into(),
            ));
        };
        if self.is_ahead(&current, key) {
            return Err(DbError::InvalidOperation(format!(
                "cannot continue to {key}: behind the cursor"
            )));
        }
        loop {
            let still_behind = self
                .current()
                .is_some_and(|row| self.is_ahead(key, &row.effective_key));
            if !still_behind {
                break;
            }
            self.pos += 1;
        }
        Ok(())
    }

    /// Advance by primary key within the current effective-key equivalence
    /// class. Stops as soon as the effective key changes, even if `key` was
    /// not reached.
    pub fn continue_primary_key(&mut self, key: &Key) -> Result<()> {
        let Some(start) = self.current().cloned() else {
            return Err(DbError::InvalidOperation(
                "cursor is not active".into(),
            ));
        };
        if self.is_ahead(&start.primary_key, key) {
            return Err(DbError::InvalidOperation(format!(
                "cannot continue to primary key {key}: behind the cursor"
            )));
        }
        loop {
            let still_behind = self.current().is_some_and(|row| {
                row.effective_key == start.effective_key && self.is_ahead(key, &row.primary_key)
            });
            if !still_behind {
                break;
            }
            self.pos += 1;
        }
        Ok(())
    }

    // In-place mutation

    /// Rewrite the record at the current primary key. The cursor stays at
    /// the current position. A record whose in-line key disagrees with the
    /// cursor's key is rejected; a unique-index conflict fails the write.
    pub fn update(&mut self, record: Value, index_selector: Option<&str>) -> Result<Key> {
        if index_selector.is_some() {
            return Err(DbError::NotImplemented(
                "updating through a secondary-index selector".into(),
            ));
        }
        let Some(pk) = self.primary_key().cloned() else {
            return Err(DbError::InvalidState("cursor is not active".into()));
        };

        let mut record = record;
        match self.store.extract_key(&record)? {
            Some(inline) if inline != pk => {
                return Err(DbError::Argument(format!(
                    "record key {inline} disagrees with cursor position {pk}"
                )));
            }
            Some(_) => {}
            None => {
                if let Some(path) = &self.store.key_path {
                    path.inject(&mut record, &pk)?;
                }
            }
        }

        let mut columns = vec![PK_COL.to_string()];
        let mut params = vec![SqlParam::Key(pk.clone())];
        for ix in &self.store.indexes {
            let key = ix.effective_key_path().extract(&record)?;
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
        params.push(SqlParam::Record(record_to_sql(&record)?));

        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(&self.store.name),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            columns.iter().map(|_| "?").collect::<Vec<_>>().join(", "),
        );
        self.exec.execute(&sql, &params)?;

        if let Some(row) = self.rows.get_mut(self.pos) {
            row.value = Some(record);
        }
        Ok(pk)
    }

    /// Delete the record at the current primary key; returns rows affected.
    pub fn clear(&mut self) -> Result<u64> {
        let Some(pk) = self.primary_key().cloned() else {
            return Err(DbError::InvalidState("cursor is not active".into()));
        };
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(&self.store.name),
            quote_ident(PK_COL),
        );
        self.exec.execute(&sql, &[SqlParam::Key(pk)])
    }

    // Resume

    /// Tighten the range to resume at `effective_key`, re-issue the
    /// statement, and skip within the resumed equivalence class until
    /// `primary_key` is reached (passed, when `exclusive`).
    pub fn restart(
        &mut self,
        effective_key: Option<&Key>,
        primary_key: Option<&Key>,
        exclusive: bool,
    ) -> Result<()> {
        if let Some(eff) = effective_key {
            let mut range = self.range.clone().unwrap_or_default();
            if self.direction.is_reverse() {
                range.upper = Some(eff.clone());
                range.upper_open = false;
            } else {
                range.lower = Some(eff.clone());
                range.lower_open = false;
            }
            self.range = Some(range);
        }
        self.materialize()?;

        if let Some(resume_pk) = primary_key {
            let class = effective_key.cloned();
            loop {
                let skip = self.current().is_some_and(|row| {
                    if let Some(class) = &class
                        && row.effective_key != *class
                    {
                        return false;
                    }
                    match row.primary_key.cmp(resume_pk) {
                        Ordering::Equal => exclusive,
                        ordering if self.direction.is_reverse() => ordering == Ordering::Greater,
                        ordering => ordering == Ordering::Less,
                    }
                });
                if !skip {
                    break;
                }
                self.pos += 1;
            }
        }
        Ok(())
    }

    /// The number of materialized rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drain the remaining rows from the current position.
    pub(crate) fn into_rows(self) -> Vec<CursorRow> {
        let mut rows = self.rows;
        rows.drain(..self.pos.min(rows.len()));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sql::SqlDriver;
    use crate::backend::{Driver, StoreTx, TxMode};
    use polydb_common::record;
    use polydb_common::schema::{DatabaseSchema, IndexSchema, KeyType};

    fn store_schema() -> StoreSchema {
        StoreSchema::new("st")
            .with_key_path("id", KeyType::Number)
            .with_index(IndexSchema::new("k", KeyType::Text))
    }

    fn driver() -> SqlDriver {
        let schema = DatabaseSchema::fixed(vec![store_schema()]);
        let driver = SqlDriver::new();
        driver.connect("t", &schema).unwrap();

        driver.transaction(
            &["st".to_string()],
            TxMode::ReadWrite,
            Box::new(|tx| {
                for (id, k) in [(1, "a"), (2, "a"), (3, "b"), (4, "c"), (5, "c")] {
                    tx.put("st", record! { "id" => id as i64, "k" => k }, None)?;
                }
                Ok(Value::Null)
            }),
        );
        driver
    }

    fn with_cursor(
        driver: &SqlDriver,
        plan: ScanPlan,
        f: impl FnOnce(&mut SqlCursor) -> Result<()> + Send + 'static,
    ) {
        let report = driver.transaction(
            &["st".to_string()],
            TxMode::ReadWrite,
            Box::new(move |tx| {
                let schema = store_schema();
                let exec = tx.sql().expect("sql surface");
                let mut cursor = SqlCursor::open(exec, &schema, &plan)?;
                f(&mut cursor)?;
                Ok(Value::Null)
            }),
        );
        report.result.unwrap();
    }

    fn index_plan() -> ScanPlan {
        ScanPlan {
            store: "st".into(),
            index: Some("k".into()),
            ..ScanPlan::default()
        }
    }

    #[test]
    fn advance_moves_by_n_and_exhausts() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            assert!(cursor.has_cursor());
            assert_eq!(cursor.primary_key(), Some(&Key::Number(1.0)));

            cursor.advance(2)?;
            assert_eq!(cursor.primary_key(), Some(&Key::Number(3.0)));

            cursor.advance(10)?;
            assert!(!cursor.has_cursor());
            assert_eq!(cursor.primary_key(), None);
            Ok(())
        });
    }

    #[test]
    fn advance_zero_is_rejected() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            let err = cursor.advance(0).unwrap_err();
            assert_eq!(err.kind(), "argument_error");
            Ok(())
        });
    }

    #[test]
    fn continue_effective_key_lands_on_reached_or_passed() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            cursor.continue_effective_key(&Key::Text("b".into()))?;
            assert_eq!(cursor.index_key(), Some(&Key::Text("b".into())));
            assert_eq!(cursor.primary_key(), Some(&Key::Number(3.0)));

            // Continuing backwards is a fatal misuse.
            let err = cursor
                .continue_effective_key(&Key::Text("a".into()))
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_operation");
            Ok(())
        });
    }

    #[test]
    fn continue_effective_key_exhausts_past_the_end() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            cursor.continue_effective_key(&Key::Text("zz".into()))?;
            assert!(!cursor.has_cursor());
            Ok(())
        });
    }

    #[test]
    fn continue_primary_key_stays_within_the_index_class() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            // Class "a" holds pks 1 and 2; asking for 5 stops at the class
            // boundary rather than crossing into "b".
            cursor.continue_primary_key(&Key::Number(5.0))?;
            assert_eq!(cursor.index_key(), Some(&Key::Text("b".into())));
            assert_eq!(cursor.primary_key(), Some(&Key::Number(3.0)));
            Ok(())
        });
    }

    #[test]
    fn continue_primary_key_reaches_within_class() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            cursor.continue_primary_key(&Key::Number(2.0))?;
            assert_eq!(cursor.primary_key(), Some(&Key::Number(2.0)));
            assert_eq!(cursor.index_key(), Some(&Key::Text("a".into())));
            Ok(())
        });
    }

    #[test]
    fn reverse_cursor_walks_backwards() {
        let driver = driver();
        let plan = ScanPlan {
            direction: Direction::Prev,
            ..index_plan()
        };
        with_cursor(&driver, plan, |cursor| {
            assert_eq!(cursor.index_key(), Some(&Key::Text("c".into())));
            assert_eq!(cursor.primary_key(), Some(&Key::Number(5.0)));
            cursor.continue_effective_key(&Key::Text("a".into()))?;
            assert_eq!(cursor.primary_key(), Some(&Key::Number(2.0)));
            Ok(())
        });
    }

    #[test]
    fn update_rewrites_in_place_and_keeps_position() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            let pk = cursor.update(record! { "id" => 1i64, "k" => "a", "v" => 42i64 }, None)?;
            assert_eq!(pk, Key::Number(1.0));
            assert_eq!(cursor.primary_key(), Some(&Key::Number(1.0)));
            assert_eq!(
                cursor.value().and_then(|v| v.get_path("v")),
                Some(&Value::Number(42.0))
            );
            Ok(())
        });

        let report = driver.transaction(
            &["st".to_string()],
            TxMode::ReadOnly,
            Box::new(|tx| Ok(tx.get("st", &Key::Number(1.0))?.unwrap())),
        );
        assert_eq!(
            report.result.unwrap().get_path("v"),
            Some(&Value::Number(42.0))
        );
    }

    #[test]
    fn update_through_index_selector_is_not_implemented() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            let err = cursor
                .update(record! { "id" => 1i64, "k" => "a" }, Some("k"))
                .unwrap_err();
            assert_eq!(err.kind(), "not_implemented");
            Ok(())
        });
    }

    #[test]
    fn clear_deletes_the_current_record() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            assert_eq!(cursor.clear()?, 1);
            Ok(())
        });

        let report = driver.transaction(
            &["st".to_string()],
            TxMode::ReadOnly,
            Box::new(|tx| Ok(Value::Number(tx.count("st", None)? as f64))),
        );
        assert_eq!(report.result.unwrap(), Value::Number(4.0));
    }

    #[test]
    fn mutation_after_exhaustion_is_invalid_state() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            cursor.advance(100)?;
            let err = cursor.clear().unwrap_err();
            assert_eq!(err.kind(), "invalid_state");
            let err = cursor
                .update(record! { "id" => 9i64, "k" => "x" }, None)
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_state");
            Ok(())
        });
    }

    #[test]
    fn restart_resumes_past_the_resume_keys() {
        let driver = driver();
        with_cursor(&driver, index_plan(), |cursor| {
            // Resume at ("a", 1) exclusively: next position is ("a", 2).
            cursor.restart(
                Some(&Key::Text("a".into())),
                Some(&Key::Number(1.0)),
                true,
            )?;
            assert_eq!(cursor.index_key(), Some(&Key::Text("a".into())));
            assert_eq!(cursor.primary_key(), Some(&Key::Number(2.0)));

            // Inclusive resume lands on the resume key itself.
            cursor.restart(
                Some(&Key::Text("c".into())),
                Some(&Key::Number(4.0)),
                false,
            )?;
            assert_eq!(cursor.index_key(), Some(&Key::Text("c".into())));
            assert_eq!(cursor.primary_key(), Some(&Key::Number(4.0)));
            Ok(())
        });
    }
}
