use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::sql::Statement;

/// Failure reported by the warehouse. The client, not the engine, decides
/// which class a failure belongs to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object store unreachable: {0}")]
    Unreachable(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

/// Tabular query result. Cells stay loosely typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl RowSet {
    pub fn scalar(column: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            columns: vec![column.to_string()],
            rows: vec![vec![value.into()]],
        }
    }

    /// First cell of the first row, if any.
    pub fn first_value(&self) -> Option<&serde_json::Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Runs a statement and returns the number of rows it affected.
    async fn execute(&self, statement: &Statement) -> Result<u64, WarehouseError>;

    async fn query(&self, statement: &Statement) -> Result<RowSet, WarehouseError>;

    /// Runs every statement inside one transaction: either all of them take
    /// effect or none does.
    async fn execute_in_transaction(&self, statements: &[Statement])
    -> Result<u64, WarehouseError>;
}

#[async_trait]
impl<W: Warehouse + ?Sized> Warehouse for Arc<W> {
    async fn execute(&self, statement: &Statement) -> Result<u64, WarehouseError> {
        (**self).execute(statement).await
    }

    async fn query(&self, statement: &Statement) -> Result<RowSet, WarehouseError> {
        (**self).query(statement).await
    }

    async fn execute_in_transaction(
        &self,
        statements: &[Statement],
    ) -> Result<u64, WarehouseError> {
        (**self).execute_in_transaction(statements).await
    }
}

/// Concrete location of source objects, e.g. `s3://bucket/log-data/2024/01`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator(pub String);

impl Locator {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn resolve_locator(
        &self,
        bucket_pattern: &str,
        key_pattern: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Locator, ObjectStoreError>;
}

/// Resolves patterns into `s3://` locators without touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Locators;

#[async_trait]
impl ObjectStore for S3Locators {
    async fn resolve_locator(
        &self,
        bucket_pattern: &str,
        key_pattern: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Locator, ObjectStoreError> {
        let bucket = render_template(bucket_pattern, params)?;
        let key = render_template(key_pattern, params)?;
        if bucket.is_empty() {
            return Err(ObjectStoreError::InvalidPattern("empty bucket".to_string()));
        }
        Ok(Locator(format!(
            "s3://{}/{}",
            bucket,
            key.trim_start_matches('/')
        )))
    }
}

/// Replaces `{name}` placeholders from `params`. `{{` and `}}` stand for
/// literal braces.
pub fn render_template(
    pattern: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, ObjectStoreError> {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(ObjectStoreError::InvalidPattern(format!(
                                "unclosed placeholder in {pattern:?}"
                            )));
                        }
                    }
                }
                let value = params.get(name.trim()).ok_or_else(|| {
                    ObjectStoreError::InvalidPattern(format!(
                        "unknown placeholder {{{name}}} in {pattern:?}"
                    ))
                })?;
                out.push_str(value);
            }
            '}' => {
                return Err(ObjectStoreError::InvalidPattern(format!(
                    "unmatched '}}' in {pattern:?}"
                )));
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Caps the number of statements in flight against the wrapped warehouse.
pub struct ConcurrencyLimited<W> {
    inner: W,
    permits: Arc<Semaphore>,
}

impl<W: Warehouse> ConcurrencyLimited<W> {
    pub fn new(inner: W, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, WarehouseError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| WarehouseError::Transient("connection pool closed".to_string()))
    }
}

#[async_trait]
impl<W: Warehouse> Warehouse for ConcurrencyLimited<W> {
    async fn execute(&self, statement: &Statement) -> Result<u64, WarehouseError> {
        let _permit = self.permit().await?;
        self.inner.execute(statement).await
    }

    async fn query(&self, statement: &Statement) -> Result<RowSet, WarehouseError> {
        let _permit = self.permit().await?;
        self.inner.query(statement).await
    }

    async fn execute_in_transaction(
        &self,
        statements: &[Statement],
    ) -> Result<u64, WarehouseError> {
        let _permit = self.permit().await?;
        self.inner.execute_in_transaction(statements).await
    }
}
