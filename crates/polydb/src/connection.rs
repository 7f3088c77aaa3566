//! The connection manager and public storage handle.
//!
//! `Storage::open` selects a backend mechanism, returns immediately, and
//! finishes connecting in a background task; every operation is wrapped as
//! a transaction request and buffered in the queue until the connection is
//! ready. Requests then run strictly one at a time, in submission order,
//! against the selected driver. The selection is final for the lifetime of
//! the connection.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use polydb_common::schema::SchemaDelta;
use polydb_common::{DatabaseSchema, DbError, Key, KeyRange, Result, StoreSchema, Value};
use tokio::sync::{oneshot, watch, Notify};

use crate::backend::{
    create_driver, CursorRow, Driver, Mechanism, ScanPlan, StoreTx, TxKind, TxMode,
};
use crate::config::StorageOptions;
use crate::query::{self, QueryIr};
use crate::txqueue::{
    RequestQueue, TxRequest, MAX_QUEUE_LEN, STALENESS_THRESHOLD, STALENESS_THRESHOLD_DEBUG,
};

/// Reserved name of the default text store.
pub const TEXT_STORE_NAME: &str = "_default_text_store";

/// Connection lifecycle, observable through [`Storage::state`] and
/// [`Storage::wait_ready`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnState {
    Connecting,
    Ready,
    Failed(DbError),
    Closed,
}

/// What a cursor-walk callback tells the walker to do next.
pub enum CursorAction {
    /// Move to the next position.
    Continue,
    /// Skip ahead by `n` positions (`n >= 1`).
    Advance(u32),
    /// Rewrite the record at the current position, then move on.
    Update(Value),
    /// Delete the record at the current position, then move on.
    Delete,
    /// Stop iterating.
    Stop,
}

/// A joint-scan solver's instruction: per-iterator step counts, or stop.
pub enum ScanStep {
    Advance(Vec<u32>),
    Stop,
}

struct StorageInner {
    name: String,
    options: StorageOptions,
    driver: Arc<dyn Driver>,
    schema: RwLock<DatabaseSchema>,
    queue: Mutex<RequestQueue>,
    wake: Notify,
    state_tx: watch::Sender<ConnState>,
    state_rx: watch::Receiver<ConnState>,
    version_change_active: AtomicBool,
}

/// A connection to one named database, over whichever backend mechanism
/// was selected at open time.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Open a connection. Backend selection happens synchronously (the
    /// first supported mechanism in the configured order wins); the
    /// connection itself is established in the background and operations
    /// queue until it is ready.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(
        name: impl Into<String>,
        schema: DatabaseSchema,
        options: StorageOptions,
    ) -> Result<Storage> {
        let name = name.into();
        let mut schema = schema;
        if options.auto_schema && schema.store_count() == 0 {
            schema = schema.into_editable();
        }
        if options.use_text_store && !schema.has_store(TEXT_STORE_NAME) {
            schema.upgrade_store(StoreSchema::new(TEXT_STORE_NAME));
        }

        let driver = options
            .mechanisms
            .iter()
            .map(|mechanism| create_driver(*mechanism, &options))
            .find(|driver| driver.is_supported())
            .ok_or_else(|| DbError::Constraint("No storage mechanism found".into()))?;
        tracing::debug!(
            database = %name,
            mechanism = driver.mechanism().id(),
            "selected storage mechanism"
        );

        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let inner = Arc::new(StorageInner {
            name,
            options,
            driver,
            schema: RwLock::new(schema),
            queue: Mutex::new(RequestQueue::new(MAX_QUEUE_LEN)),
            wake: Notify::new(),
            state_tx,
            state_rx,
            version_change_active: AtomicBool::new(false),
        });

        tokio::spawn(run_connection(inner.clone()));
        Ok(Storage { inner })
    }

    /// Open with a schema given in its JSON form.
    pub fn open_json(
        name: impl Into<String>,
        schema_json: &str,
        options: StorageOptions,
    ) -> Result<Storage> {
        let schema = DatabaseSchema::from_json(schema_json)?;
        Self::open(name, schema, options)
    }

    // Lifecycle

    /// Current connection state snapshot.
    pub fn state(&self) -> ConnState {
        self.inner.state_rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), ConnState::Ready) && self.inner.driver.is_ready()
    }

    /// The selected backend mechanism identifier.
    pub fn mechanism(&self) -> Mechanism {
        self.inner.driver.mechanism()
    }

    /// Key comparison as the selected backend performs it.
    pub fn cmp(&self, a: &Key, b: &Key) -> std::cmp::Ordering {
        self.inner.driver.cmp(a, b)
    }

    /// Wait until the connection is ready, or surface the open failure.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.state_rx.clone();
        loop {
            let state = rx.borrow().clone();
            match state {
                ConnState::Ready => return Ok(()),
                ConnState::Failed(err) => return Err(err),
                ConnState::Closed => {
                    return Err(DbError::Closed(self.inner.name.clone()));
                }
                ConnState::Connecting => {}
            }
            rx.changed()
                .await
                .map_err(|_| DbError::Closed(self.inner.name.clone()))?;
        }
    }

    /// Whether a version-change transaction is currently executing.
    pub fn version_change_in_progress(&self) -> bool {
        self.inner.version_change_active.load(AtomicOrdering::SeqCst)
    }

    /// Subscribe to lifecycle transitions: ready on first connect, failed
    /// on an open failure, closed on disconnect.
    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.inner.state_rx.clone()
    }

    /// Close the connection. Pending requests are purged with an error.
    pub fn close(&self) {
        {
            let mut queue = self.inner.queue.lock();
            let _ = self.inner.state_tx.send(ConnState::Closed);
            queue.purge(&DbError::Closed(self.inner.name.clone()));
        }
        self.inner.wake.notify_one();
        self.inner.driver.close();
        tracing::debug!(database = %self.inner.name, "connection closed");
    }

    // Schema administration

    /// A snapshot of the reconciled schema.
    pub fn get_schema(&self) -> DatabaseSchema {
        self.inner.schema.read().clone()
    }

    /// Add a store at runtime. Requires an editable (auto-schema) schema;
    /// the store is created through a version-change transaction.
    pub async fn add_store_schema(&self, store: StoreSchema) -> Result<()> {
        if !self.get_schema().is_editable() {
            return Err(DbError::Constraint(format!(
                "schema is not editable, cannot add store '{}'",
                store.name
            )));
        }
        let scope = vec![store.name.clone()];
        let delta = SchemaDelta {
            create_stores: vec![store],
            ..SchemaDelta::default()
        };
        let schema = self
            .run_tx("add_store_schema", scope, TxMode::VersionChange, move |tx| {
                tx.apply_delta(&delta)?;
                Ok(tx.schema())
            })
            .await?;
        *self.inner.schema.write() = schema;
        Ok(())
    }

    // CRUD operations

    /// Upsert one record; returns the assigned primary key.
    pub async fn put(&self, store: &str, record: Value) -> Result<Key> {
        let store_name = store.to_string();
        self.run_tx("put", vec![store_name.clone()], TxMode::ReadWrite, move |tx| {
            tx.put(&store_name, record, None)
        })
        .await
    }

    /// Upsert one record under an out-of-line key.
    pub async fn put_with_key(&self, store: &str, record: Value, key: Key) -> Result<Key> {
        let store_name = store.to_string();
        self.run_tx("put", vec![store_name.clone()], TxMode::ReadWrite, move |tx| {
            tx.put(&store_name, record, Some(key))
        })
        .await
    }

    /// Upsert a batch, with optional out-of-line keys; returns the assigned
    /// keys in input order.
    pub async fn put_all(
        &self,
        store: &str,
        records: Vec<Value>,
        keys: Option<Vec<Key>>,
    ) -> Result<Vec<Key>> {
        if let Some(keys) = &keys
            && keys.len() != records.len()
        {
            return Err(DbError::Argument(format!(
                "{} records but {} out-of-line keys",
                records.len(),
                keys.len()
            )));
        }
        let store_name = store.to_string();
        self.run_tx("put", vec![store_name.clone()], TxMode::ReadWrite, move |tx| {
            let mut out = Vec::with_capacity(records.len());
            let mut keys = keys.map(Vec::into_iter);
            for record in records {
                let key = keys.as_mut().and_then(|it| it.next());
                out.push(tx.put(&store_name, record, key)?);
            }
            Ok(out)
        })
        .await
    }

    /// Insert one record; fails with a constraint error when the primary
    /// key already exists.
    pub async fn add(&self, store: &str, record: Value) -> Result<Key> {
        let store_name = store.to_string();
        self.run_tx("add", vec![store_name.clone()], TxMode::ReadWrite, move |tx| {
            tx.add(&store_name, record, None)
        })
        .await
    }

    /// Insert one record under an out-of-line key.
    pub async fn add_with_key(&self, store: &str, record: Value, key: Key) -> Result<Key> {
        let store_name = store.to_string();
        self.run_tx("add", vec![store_name.clone()], TxMode::ReadWrite, move |tx| {
            tx.add(&store_name, record, Some(key))
        })
        .await
    }

    /// Fetch one record. A missing key is not an error.
    pub async fn get(&self, store: &str, key: Key) -> Result<Option<Value>> {
        let store_name = store.to_string();
        self.run_tx("get", vec![store_name.clone()], TxMode::ReadOnly, move |tx| {
            tx.get(&store_name, &key)
        })
        .await
    }

    /// Fetch records for a list of keys, in the given key order. Missing
    /// keys yield `None` at their position.
    pub async fn list(&self, store: &str, keys: Vec<Key>) -> Result<Vec<Option<Value>>> {
        let store_name = store.to_string();
        self.run_tx("list", vec![store_name.clone()], TxMode::ReadOnly, move |tx| {
            keys.iter().map(|key| tx.get(&store_name, key)).collect()
        })
        .await
    }

    /// Fetch every record in the range, in key order.
    pub async fn list_range(&self, store: &str, range: KeyRange) -> Result<Vec<Value>> {
        let store_name = store.to_string();
        self.run_tx("list", vec![store_name.clone()], TxMode::ReadOnly, move |tx| {
            let rows = tx.scan(&ScanPlan {
                store: store_name.clone(),
                range: Some(range),
                ..ScanPlan::default()
            })?;
            Ok(rows.into_iter().filter_map(|row| row.value).collect())
        })
        .await
    }

    /// Count records, optionally restricted to a range.
    pub async fn count(&self, store: &str, range: Option<KeyRange>) -> Result<u64> {
        let store_name = store.to_string();
        self.run_tx("count", vec![store_name.clone()], TxMode::ReadOnly, move |tx| {
            tx.count(&store_name, range.as_ref())
        })
        .await
    }

    /// Empty one store. Returns the number of stores affected (1).
    pub async fn clear(&self, store: &str) -> Result<u64> {
        self.clear_many(vec![store.to_string()]).await
    }

    /// Empty several stores; returns how many were affected.
    pub async fn clear_many(&self, stores: Vec<String>) -> Result<u64> {
        let scope = stores.clone();
        self.run_tx("clear", scope, TxMode::ReadWrite, move |tx| {
            for store in &stores {
                tx.clear_store(store)?;
            }
            Ok(stores.len() as u64)
        })
        .await
    }

    /// Empty every store in the schema; returns how many were affected.
    pub async fn clear_all(&self) -> Result<u64> {
        self.clear_many(self.get_schema().store_names()).await
    }

    /// Delete one record by key; returns the number removed (0 or 1).
    pub async fn remove(&self, store: &str, key: Key) -> Result<u64> {
        let store_name = store.to_string();
        self.run_tx("remove", vec![store_name.clone()], TxMode::ReadWrite, move |tx| {
            tx.delete(&store_name, &key)
        })
        .await
    }

    /// Delete every record in the range; returns the number removed.
    pub async fn remove_range(&self, store: &str, range: KeyRange) -> Result<u64> {
        let store_name = store.to_string();
        self.run_tx("remove", vec![store_name.clone()], TxMode::ReadWrite, move |tx| {
            tx.delete_range(&store_name, &range)
        })
        .await
    }

    // Queries

    /// Run a constructed query IR.
    pub async fn query(&self, ir: QueryIr) -> Result<Value> {
        let scope = vec![ir.store.clone()];
        self.run_tx("query", scope, TxMode::ReadOnly, move |tx| {
            query::run_query(tx, &ir)
        })
        .await
    }

    /// Parse and run a query in the accepted SQL grammar.
    pub async fn execute_sql(&self, sql: &str) -> Result<Value> {
        let ir = query::parse_query(sql)?;
        self.query(ir).await
    }

    // Iteration

    /// Walk a cursor over the iterator, invoking the callback per row.
    /// The callback's action controls advancement and may rewrite or
    /// delete the current record (use `ReadWrite` mode for those). Returns
    /// the number of rows visited.
    pub async fn open<F>(&self, plan: ScanPlan, mode: TxMode, callback: F) -> Result<u64>
    where
        F: FnMut(&CursorRow) -> CursorAction + Send + 'static,
    {
        let scope = vec![plan.store.clone()];
        self.run_tx("open", scope, mode, move |tx| walk(tx, &plan, callback))
            .await
    }

    /// Map every record the iterator yields through `f`.
    pub async fn map<F>(&self, plan: ScanPlan, f: F) -> Result<Vec<Value>>
    where
        F: Fn(&Value) -> Value + Send + 'static,
    {
        let scope = vec![plan.store.clone()];
        self.run_tx("map", scope, TxMode::ReadOnly, move |tx| {
            let rows = materialize(tx, &plan)?;
            Ok(rows
                .into_iter()
                .filter_map(|row| row.value)
                .map(|record| f(&record))
                .collect())
        })
        .await
    }

    /// Fold every record the iterator yields into an accumulator.
    pub async fn reduce<F>(&self, plan: ScanPlan, f: F, init: Value) -> Result<Value>
    where
        F: Fn(Value, &Value, usize) -> Value + Send + 'static,
    {
        let scope = vec![plan.store.clone()];
        self.run_tx("reduce", scope, TxMode::ReadOnly, move |tx| {
            let rows = materialize(tx, &plan)?;
            let mut acc = init;
            for (i, record) in rows.into_iter().filter_map(|row| row.value).enumerate() {
                acc = f(acc, &record, i);
            }
            Ok(acc)
        })
        .await
    }

    /// Drive several iterators jointly: the solver sees every iterator's
    /// current effective and primary keys and decides how far each one
    /// advances. Higher-level join strategies live in the solver, not here.
    pub async fn scan<F>(&self, plans: Vec<ScanPlan>, solver: F) -> Result<()>
    where
        F: FnMut(&[Option<Key>], &[Option<Key>]) -> ScanStep + Send + 'static,
    {
        let scope: Vec<String> = plans.iter().map(|p| p.store.clone()).collect();
        let mut solver = solver;
        self.run_tx("scan", scope, TxMode::ReadOnly, move |tx| {
            let mut streams: Vec<Vec<CursorRow>> = Vec::with_capacity(plans.len());
            for plan in &plans {
                streams.push(materialize(tx, plan)?);
            }
            let mut positions = vec![0usize; streams.len()];
            loop {
                let effective: Vec<Option<Key>> = streams
                    .iter()
                    .zip(&positions)
                    .map(|(rows, &pos)| rows.get(pos).map(|r| r.effective_key.clone()))
                    .collect();
                if effective.iter().all(Option::is_none) {
                    break;
                }
                let primary: Vec<Option<Key>> = streams
                    .iter()
                    .zip(&positions)
                    .map(|(rows, &pos)| rows.get(pos).map(|r| r.primary_key.clone()))
                    .collect();
                match solver(&effective, &primary) {
                    ScanStep::Stop => break,
                    ScanStep::Advance(steps) => {
                        if steps.iter().all(|&n| n == 0) {
                            break;
                        }
                        for (pos, step) in positions.iter_mut().zip(steps) {
                            *pos += step as usize;
                        }
                    }
                }
            }
            Ok(Value::Null)
        })
        .await?;
        Ok(())
    }

    /// Run an arbitrary closure as one transaction over the named stores.
    pub async fn transaction<T, F>(
        &self,
        stores: Vec<String>,
        mode: TxMode,
        closure: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn StoreTx) -> Result<T> + Send + 'static,
    {
        self.run_tx("transaction", stores, mode, closure).await
    }

    // Internals

    async fn run_tx<T, F>(
        &self,
        label: &'static str,
        stores: Vec<String>,
        mode: TxMode,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn StoreTx) -> Result<T> + Send + 'static,
    {
        let (out_tx, mut out_rx) = oneshot::channel::<T>();
        let (done_tx, done_rx) = oneshot::channel();
        let request = TxRequest {
            label,
            stores,
            mode,
            closure: Box::new(move |tx| {
                let value = f(tx)?;
                let _ = out_tx.send(value);
                Ok(Value::Null)
            }),
            done: done_tx,
        };

        {
            // Checking state and enqueueing under one lock keeps a failing
            // connection from purging past a request mid-submit.
            let mut queue = self.inner.queue.lock();
            match &*self.inner.state_rx.borrow() {
                ConnState::Failed(err) => return Err(err.clone()),
                ConnState::Closed => {
                    return Err(DbError::Closed(self.inner.name.clone()));
                }
                _ => queue.push(request),
            }
        }
        self.inner.wake.notify_one();

        let (kind, result) = done_rx
            .await
            .map_err(|_| DbError::Internal("transaction request dropped".into()))?;
        result?;
        match kind {
            TxKind::Error => Err(DbError::Internal(
                "transaction reported an error without detail".into(),
            )),
            _ => out_rx
                .try_recv()
                .map_err(|_| DbError::Internal("transaction produced no result".into())),
        }
    }
}

/// Materialize an iterator's rows, with unique-direction suppression.
fn materialize(tx: &mut dyn StoreTx, plan: &ScanPlan) -> Result<Vec<CursorRow>> {
    let mut rows = tx.scan(plan)?;
    if plan.direction.is_unique() {
        crate::query::native::dedupe_by_effective_key(&mut rows);
    }
    Ok(rows)
}

fn walk(
    tx: &mut dyn StoreTx,
    plan: &ScanPlan,
    mut callback: impl FnMut(&CursorRow) -> CursorAction,
) -> Result<u64> {
    let store_schema = tx
        .schema()
        .store(&plan.store)
        .cloned()
        .ok_or_else(|| DbError::Argument(format!("unknown store '{}'", plan.store)))?;
    let rows = materialize(tx, plan)?;

    let mut visited = 0u64;
    let mut pos = 0usize;
    while pos < rows.len() {
        let row = rows[pos].clone();
        visited += 1;
        match callback(&row) {
            CursorAction::Continue => pos += 1,
            CursorAction::Advance(0) => {
                return Err(DbError::Argument(
                    "advance requires a step of at least 1".into(),
                ));
            }
            CursorAction::Advance(n) => pos += n as usize,
            CursorAction::Update(record) => {
                let key = store_schema.key_path.is_none().then(|| row.primary_key.clone());
                tx.put(&plan.store, record, key)?;
                pos += 1;
            }
            CursorAction::Delete => {
                tx.delete(&plan.store, &row.primary_key)?;
                pos += 1;
            }
            CursorAction::Stop => break,
        }
    }
    Ok(visited)
}

// Connection task

async fn run_connection(inner: Arc<StorageInner>) {
    let connected = {
        let schema = inner.schema.read().clone();
        inner.driver.connect(&inner.name, &schema)
    };
    match connected {
        Ok(reconciled) => {
            *inner.schema.write() = reconciled;
            let _ = inner.state_tx.send(ConnState::Ready);
            tracing::debug!(database = %inner.name, "connected");
        }
        Err(err) => {
            tracing::error!(database = %inner.name, error = %err, "connection failed");
            let mut queue = inner.queue.lock();
            let _ = inner.state_tx.send(ConnState::Failed(err.clone()));
            queue.purge(&err);
            return;
        }
    }

    loop {
        if matches!(&*inner.state_rx.borrow(), ConnState::Closed) {
            inner
                .queue
                .lock()
                .purge(&DbError::Closed(inner.name.clone()));
            return;
        }
        let request = inner.queue.lock().pop();
        match request {
            Some(request) => run_request(&inner, request).await,
            None => inner.wake.notified().await,
        }
    }
}

async fn run_request(inner: &Arc<StorageInner>, request: TxRequest) {
    let TxRequest {
        label,
        stores,
        mode,
        closure,
        done,
    } = request;

    if mode == TxMode::VersionChange {
        inner
            .version_change_active
            .store(true, AtomicOrdering::SeqCst);
    }

    let threshold = if inner.options.debug {
        STALENESS_THRESHOLD_DEBUG
    } else {
        STALENESS_THRESHOLD
    };
    let driver = inner.driver.clone();
    let mut handle =
        tokio::task::spawn_blocking(move || driver.transaction(&stores, mode, closure));

    let report = loop {
        tokio::select! {
            joined = &mut handle => {
                break joined.map_err(|e| DbError::Internal(format!("transaction task: {e}")));
            }
            _ = tokio::time::sleep(threshold) => {
                tracing::warn!(
                    label,
                    threshold_ms = threshold.as_millis() as u64,
                    "transaction has not completed within the staleness threshold"
                );
            }
        }
    };

    if mode == TxMode::VersionChange {
        inner
            .version_change_active
            .store(false, AtomicOrdering::SeqCst);
        // A schema mutated by the version change must be visible to later
        // validation, so refresh the cached copy from the driver.
        if matches!(&report, Ok(r) if r.kind == TxKind::Complete) {
            let slot = Arc::new(Mutex::new(None));
            let sink = slot.clone();
            let _ = inner.driver.transaction(
                &[],
                TxMode::ReadOnly,
                Box::new(move |tx| {
                    *sink.lock() = Some(tx.schema());
                    Ok(Value::Null)
                }),
            );
            if let Some(schema) = slot.lock().take() {
                *inner.schema.write() = schema;
            }
        }
    }

    match report {
        Ok(report) => {
            if report.kind == TxKind::Error {
                tracing::debug!(label, error = ?report.result.as_ref().err(), "transaction failed");
            }
            let _ = done.send((report.kind, report.result));
        }
        Err(err) => {
            let _ = done.send((TxKind::Error, Err(err)));
        }
    }
}
