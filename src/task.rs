use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::client::{Locator, ObjectStore, Warehouse};
use crate::operators::{self, quality::QualityCheck};
use crate::TaskError;

/// Shared, read-only inputs of one run.
#[derive(Clone)]
pub struct RunContext {
    pub run_date: NaiveDate,
    pub params: BTreeMap<String, String>,
    pub warehouse: Arc<dyn Warehouse>,
    pub object_store: Arc<dyn ObjectStore>,
}

impl RunContext {
    pub fn new(
        run_date: NaiveDate,
        warehouse: Arc<dyn Warehouse>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            run_date,
            params: BTreeMap::new(),
            warehouse,
            object_store,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Values available to `{name}` placeholders in source patterns. Extra
    /// params win over the date-derived ones.
    pub fn template_params(&self) -> BTreeMap<String, String> {
        let d = self.run_date;
        let mut out = BTreeMap::from([
            ("ds".to_string(), d.format("%Y-%m-%d").to_string()),
            ("ds_nodash".to_string(), d.format("%Y%m%d").to_string()),
            ("year".to_string(), d.year().to_string()),
            ("month".to_string(), format!("{:02}", d.month())),
            ("day".to_string(), format!("{:02}", d.day())),
        ]);
        out.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_date", &self.run_date)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Bulk load of JSON records from object storage into a staging table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLoad {
    pub table: String,
    pub bucket: String,
    /// May contain placeholders such as `{ds}` or `{year}`.
    pub key_pattern: String,
    pub region: String,
    #[serde(default = "default_ignore_header")]
    pub ignore_header: u32,
    /// JSONPaths file locator, or `auto`.
    #[serde(default = "default_json_paths")]
    pub json_paths: String,
    #[serde(default)]
    pub iam_role: Option<String>,
}

fn default_ignore_header() -> u32 {
    1
}

fn default_json_paths() -> String {
    "auto".to_string()
}

impl StageLoad {
    pub fn new(table: &str, bucket: &str, key_pattern: &str, region: &str) -> Self {
        Self {
            table: table.to_string(),
            bucket: bucket.to_string(),
            key_pattern: key_pattern.to_string(),
            region: region.to_string(),
            ignore_header: default_ignore_header(),
            json_paths: default_json_paths(),
            iam_role: None,
        }
    }
}

/// Append-only insert-select into a fact table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactLoad {
    pub table: String,
    pub select: String,
    /// Rows matching this predicate are deleted in the same transaction
    /// before the insert, making reruns over one window exact-once.
    #[serde(default)]
    pub delete_window: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionLoad {
    pub table: String,
    pub select: String,
    /// Replace the whole table instead of appending.
    #[serde(default = "default_replace")]
    pub replace: bool,
}

fn default_replace() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub table: String,
    pub checks: Vec<QualityCheck>,
}

/// Trusted statements run together in one transaction, typically DDL or
/// staging truncation ahead of a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlScript {
    pub statements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Stage(StageLoad),
    LoadFact(FactLoad),
    LoadDimension(DimensionLoad),
    QualityCheck(QualityGate),
    Sql(SqlScript),
    NoOp,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stage(_) => "stage",
            Self::LoadFact(_) => "load_fact",
            Self::LoadDimension(_) => "load_dimension",
            Self::QualityCheck(_) => "quality_check",
            Self::Sql(_) => "sql",
            Self::NoOp => "no_op",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutput {
    Nothing,
    Staged { locator: Locator, rows: u64 },
    Loaded { rows: u64 },
    Checked { passed: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failed optional task ends `Skipped` rather than `Failed`.
    #[serde(default)]
    pub optional: bool,
}

impl Task {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            depends_on: Vec::new(),
            optional: false,
        }
    }

    pub fn no_op(name: impl Into<String>) -> Self {
        Self::new(name, TaskKind::NoOp)
    }

    pub fn stage(name: impl Into<String>, load: StageLoad) -> Self {
        Self::new(name, TaskKind::Stage(load))
    }

    pub fn load_fact(name: impl Into<String>, table: &str, select: &str) -> Self {
        Self::new(
            name,
            TaskKind::LoadFact(FactLoad {
                table: table.to_string(),
                select: select.to_string(),
                delete_window: None,
            }),
        )
    }

    pub fn load_dimension(
        name: impl Into<String>,
        table: &str,
        select: &str,
        replace: bool,
    ) -> Self {
        Self::new(
            name,
            TaskKind::LoadDimension(DimensionLoad {
                table: table.to_string(),
                select: select.to_string(),
                replace,
            }),
        )
    }

    pub fn quality_check(name: impl Into<String>, table: &str, checks: Vec<QualityCheck>) -> Self {
        Self::new(
            name,
            TaskKind::QualityCheck(QualityGate {
                table: table.to_string(),
                checks,
            }),
        )
    }

    pub fn sql<I, S>(name: impl Into<String>, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            TaskKind::Sql(SqlScript {
                statements: statements.into_iter().map(Into::into).collect(),
            }),
        )
    }

    pub fn after<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on
            .extend(predecessors.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Quality failures describe the data, not the infrastructure, so a
    /// quality check is never retried on its own.
    pub fn may_retry(&self, err: &TaskError) -> bool {
        err.is_retryable() && !matches!(self.kind, TaskKind::QualityCheck(_))
    }

    pub async fn run(&self, ctx: &RunContext) -> Result<TaskOutput, TaskError> {
        match &self.kind {
            TaskKind::Stage(load) => operators::stage::run(load, ctx).await,
            TaskKind::LoadFact(load) => operators::load_fact::run(load, ctx).await,
            TaskKind::LoadDimension(load) => operators::load_dimension::run(load, ctx).await,
            TaskKind::QualityCheck(gate) => operators::quality::run(gate, ctx).await,
            TaskKind::Sql(script) => operators::run_script(script, ctx).await,
            TaskKind::NoOp => Ok(TaskOutput::Nothing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::S3Locators;
    use crate::testing::MockWarehouse;

    fn ctx() -> RunContext {
        RunContext::new(
            NaiveDate::from_ymd_opt(2018, 11, 3).unwrap(),
            Arc::new(MockWarehouse::new()),
            Arc::new(S3Locators),
        )
    }

    #[test]
    fn template_params_derive_from_run_date() {
        let params = ctx().with_param("prefix", "events").template_params();
        assert_eq!(params["ds"], "2018-11-03");
        assert_eq!(params["ds_nodash"], "20181103");
        assert_eq!(params["month"], "11");
        assert_eq!(params["day"], "03");
        assert_eq!(params["prefix"], "events");
    }

    #[test]
    fn extra_params_override_derived_ones() {
        let params = ctx().with_param("ds", "2020-01-01").template_params();
        assert_eq!(params["ds"], "2020-01-01");
    }

    #[test]
    fn quality_checks_are_never_retried() {
        let task = Task::quality_check("dq", "songplays", vec![]);
        assert!(!task.may_retry(&TaskError::WarehouseTransient("timeout".into())));

        let task = Task::load_fact("fact", "songplays", "SELECT 1");
        assert!(task.may_retry(&TaskError::WarehouseTransient("timeout".into())));
        assert!(!task.may_retry(&TaskError::WarehouseRejected("syntax".into())));
    }

    #[test]
    fn definition_parses_from_json() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "name": "Stage_events",
            "kind": "stage",
            "table": "staging_events",
            "bucket": "akwayaga",
            "key_pattern": "log-data/{year}/{month}",
            "region": "us-west-2",
            "depends_on": ["Begin_execution"]
        }))
        .unwrap();

        assert_eq!(task.dependencies(), ["Begin_execution".to_string()]);
        match task.kind {
            TaskKind::Stage(load) => {
                assert_eq!(load.ignore_header, 1);
                assert_eq!(load.json_paths, "auto");
            }
            other => panic!("expected stage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_op_does_nothing() {
        let out = Task::no_op("Begin_execution").run(&ctx()).await.unwrap();
        assert_eq!(out, TaskOutput::Nothing);
    }
}
