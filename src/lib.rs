pub mod client;
pub mod config;
pub mod cycle_check;
pub mod executor;
pub mod graph;
pub mod operators;
pub mod retry;
pub mod sql;
pub mod state;
pub mod task;
pub mod testing;

pub use client::{
    ConcurrencyLimited, Locator, ObjectStore, ObjectStoreError, RowSet, S3Locators, Warehouse,
    WarehouseError,
};
pub use config::RunConfig;
pub use cycle_check::find_cycle;
pub use executor::Engine;
pub use graph::{DependencyGraph, GraphBuilder, RunDefinition};
pub use operators::quality::{Expectation, QualityCheck};
pub use retry::{Attempted, RetryExecutor, RetryPolicy};
pub use sql::{SqlValue, Statement, StatementBuilder};
pub use state::{FailedTask, RunReport, RunStatus, TaskState, TaskStatus};
pub use task::{
    DimensionLoad, FactLoad, QualityGate, RunContext, SqlScript, StageLoad, Task, TaskKind,
    TaskOutput,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or validating a dependency graph. Any of
/// these aborts the run before a single statement reaches the warehouse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("circular dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

/// Failure of a single task attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),
    #[error("load rejected: {0}")]
    LoadRejected(String),
    #[error("warehouse transient error: {0}")]
    WarehouseTransient(String),
    #[error("warehouse rejected statement: {0}")]
    WarehouseRejected(String),
    #[error("quality check failed: {check} (actual: {actual})")]
    QualityCheckFailed { check: String, actual: String },
    #[error("misconfigured task: {0}")]
    Misconfigured(String),
    /// The run was aborted before the next attempt; `last` is the failure
    /// that attempt would have retried.
    #[error("run aborted before retry; last error: {last}")]
    Cancelled { last: Box<TaskError> },
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Whether another attempt could plausibly succeed. Only connectivity
    /// and timeout failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnreachable(_) | Self::WarehouseTransient(_))
    }
}

impl From<WarehouseError> for TaskError {
    fn from(e: WarehouseError) -> Self {
        match e {
            WarehouseError::Transient(msg) => TaskError::WarehouseTransient(msg),
            WarehouseError::Rejected(msg) => TaskError::WarehouseRejected(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TaskError::SourceUnreachable("s3 down".into()).is_retryable());
        assert!(TaskError::WarehouseTransient("timeout".into()).is_retryable());
        assert!(!TaskError::LoadRejected("bad json".into()).is_retryable());
        assert!(!TaskError::WarehouseRejected("syntax".into()).is_retryable());
        assert!(
            !TaskError::QualityCheckFailed {
                check: "rowcount>0".into(),
                actual: "0".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn warehouse_errors_keep_their_class() {
        let e: TaskError = WarehouseError::Transient("reset".into()).into();
        assert_eq!(e, TaskError::WarehouseTransient("reset".into()));
        let e: TaskError = WarehouseError::Rejected("constraint".into()).into();
        assert_eq!(e, TaskError::WarehouseRejected("constraint".into()));
    }

    #[test]
    fn cycle_error_shows_path() {
        let e = DagError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(e.to_string(), "circular dependency detected: a -> b -> a");
    }
}
