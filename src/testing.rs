//! In-memory collaborators for tests and demos.
//!
//! `MockWarehouse` understands the statement shapes this crate generates
//! (`COPY`, `INSERT INTO .. SELECT`, `DELETE FROM`, `TRUNCATE`,
//! `SELECT COUNT(*) FROM`) well enough to keep per-table row sets, records
//! every statement it sees, and replays scripted failures.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::client::{Locator, ObjectStore, ObjectStoreError, RowSet, Warehouse, WarehouseError};
use crate::sql::Statement;

type Row = Vec<Value>;

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    select_rows: HashMap<String, Vec<Row>>,
    source_rows: HashMap<String, Vec<Row>>,
    query_results: Vec<(String, RowSet)>,
    failures: Vec<(String, VecDeque<WarehouseError>)>,
    persistent_failures: Vec<(String, WarehouseError)>,
    log: Vec<String>,
    transactions: Vec<Vec<String>>,
}

#[derive(Default)]
pub struct MockWarehouse {
    inner: Mutex<Inner>,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows an `INSERT INTO .. <select>` appends for this exact select text.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_select_rows(&self, select: &str, rows: Vec<Row>) {
        self.inner
            .lock()
            .unwrap()
            .select_rows
            .insert(normalize(select), rows);
    }

    /// Rows a `COPY` from this locator appends.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_source_rows(&self, locator: &str, rows: Vec<Row>) {
        self.inner
            .lock()
            .unwrap()
            .source_rows
            .insert(locator.to_string(), rows);
    }

    /// Any query whose SQL contains `pattern` returns `rows`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_query_result(&self, pattern: &str, rows: RowSet) {
        self.inner
            .lock()
            .unwrap()
            .query_results
            .push((pattern.to_string(), rows));
    }

    /// The next statement containing `pattern` fails with `err`. Calls
    /// queue up: scripting two failures fails the next two matches.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next(&self, pattern: &str, err: WarehouseError) {
        let mut inner = self.inner.lock().unwrap();
        match inner.failures.iter_mut().find(|(p, _)| p == pattern) {
            Some((_, queue)) => queue.push_back(err),
            None => inner
                .failures
                .push((pattern.to_string(), VecDeque::from([err]))),
        }
    }

    /// Every statement containing `pattern` fails with `err`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_always(&self, pattern: &str, err: WarehouseError) {
        self.inner
            .lock()
            .unwrap()
            .persistent_failures
            .push((pattern.to_string(), err));
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn put_rows(&self, table: &str, rows: Vec<Row>) {
        self.inner
            .lock()
            .unwrap()
            .tables
            .insert(table.to_string(), rows);
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn table(&self, table: &str) -> Vec<Row> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every statement received, inline-rendered, in arrival order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn statements(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Statements grouped per committed or attempted transaction.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn transactions(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().transactions.clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }
}

impl Inner {
    fn scripted_failure(&mut self, sql: &str) -> Option<WarehouseError> {
        for (pattern, queue) in self.failures.iter_mut() {
            if sql.contains(pattern.as_str()) {
                if let Some(err) = queue.pop_front() {
                    return Some(err);
                }
            }
        }
        self.persistent_failures
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, err)| err.clone())
    }

    fn apply(
        &mut self,
        tables: &mut HashMap<String, Vec<Row>>,
        statement: &Statement,
    ) -> Result<u64, WarehouseError> {
        let sql = statement.render_inline();
        self.log.push(sql.clone());
        if let Some(err) = self.scripted_failure(&sql) {
            return Err(err);
        }

        let upper = sql.trim_start().to_ascii_uppercase();
        if let Some(rest) = strip_keyword(&sql, &upper, "INSERT INTO ") {
            let (table, select) = split_table(rest);
            let rows = self
                .select_rows
                .get(&normalize(select))
                .cloned()
                .unwrap_or_default();
            let n = rows.len() as u64;
            tables.entry(table).or_default().extend(rows);
            return Ok(n);
        }
        if let Some(rest) = strip_keyword(&sql, &upper, "COPY ") {
            let (table, _) = split_table(rest);
            let rows = statement
                .params
                .first()
                .and_then(|p| match p {
                    crate::sql::SqlValue::Text(loc) => self.source_rows.get(loc).cloned(),
                    crate::sql::SqlValue::Int(_) => None,
                })
                .unwrap_or_default();
            let n = rows.len() as u64;
            tables.entry(table).or_default().extend(rows);
            return Ok(n);
        }
        // Any WHERE clause is treated as covering the whole table.
        let cleared = strip_keyword(&sql, &upper, "DELETE FROM ")
            .or_else(|| strip_keyword(&sql, &upper, "TRUNCATE TABLE "))
            .or_else(|| strip_keyword(&sql, &upper, "TRUNCATE "));
        if let Some(rest) = cleared {
            let (table, _) = split_table(rest);
            let removed = tables.remove(&table).map(|r| r.len()).unwrap_or(0);
            return Ok(removed as u64);
        }
        Ok(0)
    }
}

#[async_trait]
impl Warehouse for MockWarehouse {
    async fn execute(&self, statement: &Statement) -> Result<u64, WarehouseError> {
        let mut inner = self.inner.lock().unwrap();
        let mut tables = std::mem::take(&mut inner.tables);
        let result = inner.apply(&mut tables, statement);
        inner.tables = tables;
        result
    }

    async fn query(&self, statement: &Statement) -> Result<RowSet, WarehouseError> {
        let mut inner = self.inner.lock().unwrap();
        let sql = statement.render_inline();
        inner.log.push(sql.clone());
        if let Some(err) = inner.scripted_failure(&sql) {
            return Err(err);
        }
        if let Some((_, rows)) = inner
            .query_results
            .iter()
            .rev()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
        {
            return Ok(rows.clone());
        }

        let upper = sql.to_ascii_uppercase();
        if let Some(rest) = strip_keyword(&sql, &upper, "SELECT COUNT(*) FROM ") {
            let (table, tail) = split_table(rest);
            if tail.trim().is_empty() {
                let count = inner.tables.get(&table).map(Vec::len).unwrap_or(0);
                return Ok(RowSet::scalar("count", count as u64));
            }
        }
        Err(WarehouseError::Rejected(format!("no scripted result for {sql}")))
    }

    async fn execute_in_transaction(
        &self,
        statements: &[Statement],
    ) -> Result<u64, WarehouseError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .transactions
            .push(statements.iter().map(Statement::render_inline).collect());

        let mut scratch = inner.tables.clone();
        let mut total = 0;
        for statement in statements {
            total += inner.apply(&mut scratch, statement)?;
        }
        inner.tables = scratch;
        Ok(total)
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .to_string()
}

fn strip_keyword<'a>(sql: &'a str, upper: &str, keyword: &str) -> Option<&'a str> {
    let trimmed = sql.trim_start();
    upper
        .trim_start()
        .starts_with(keyword)
        .then(|| &trimmed[keyword.len()..])
}

/// Splits `"schema"."table" rest` into an unquoted name and the rest.
fn split_table(rest: &str) -> (String, &str) {
    let rest = rest.trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let name = rest[..end].replace('"', "");
    (name, &rest[end..])
}

/// Delays every call to the wrapped warehouse and remembers the highest
/// number of calls that were in flight at once.
pub struct SlowWarehouse<W> {
    inner: W,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl<W: Warehouse> SlowWarehouse<W> {
    pub fn new(inner: W, latency: Duration) -> Self {
        Self {
            inner,
            latency,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn call<T>(&self, f: impl Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let out = f.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl<W: Warehouse> Warehouse for SlowWarehouse<W> {
    async fn execute(&self, statement: &Statement) -> Result<u64, WarehouseError> {
        self.call(self.inner.execute(statement)).await
    }

    async fn query(&self, statement: &Statement) -> Result<RowSet, WarehouseError> {
        self.call(self.inner.query(statement)).await
    }

    async fn execute_in_transaction(
        &self,
        statements: &[Statement],
    ) -> Result<u64, WarehouseError> {
        self.call(self.inner.execute_in_transaction(statements))
            .await
    }
}

/// Object store that resolves through a wrapped resolver but can be told to
/// fail.
pub struct MockObjectStore<S> {
    inner: S,
    failures: Mutex<VecDeque<ObjectStoreError>>,
    resolved: Mutex<Vec<Locator>>,
}

impl<S: ObjectStore> MockObjectStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failures: Mutex::new(VecDeque::new()),
            resolved: Mutex::new(Vec::new()),
        }
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next(&self, err: ObjectStoreError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn resolved(&self) -> Vec<Locator> {
        self.resolved.lock().unwrap().clone()
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for MockObjectStore<S> {
    async fn resolve_locator(
        &self,
        bucket_pattern: &str,
        key_pattern: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Locator, ObjectStoreError> {
        let scripted = self.failures.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        let locator = self
            .inner
            .resolve_locator(bucket_pattern, key_pattern, params)
            .await?;
        self.resolved.lock().unwrap().push(locator.clone());
        Ok(locator)
    }
}
