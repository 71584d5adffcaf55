//! Data-quality gate. Checks run in order and the first failure ends the
//! task; nothing here writes to the warehouse.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::client::RowSet;
use crate::sql::{InvalidIdentifier, Statement, StatementBuilder};
use crate::task::{QualityGate, RunContext, TaskOutput};
use crate::TaskError;

/// Predicate over the scalar a check query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    GreaterThan(i64),
    Equals(i64),
    AtMost(i64),
}

impl Expectation {
    pub fn holds(self, actual: i64) -> bool {
        match self {
            Self::GreaterThan(n) => actual > n,
            Self::Equals(n) => actual == n,
            Self::AtMost(n) => actual <= n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub description: String,
    pub statement: Statement,
    pub expectation: Expectation,
}

impl QualityCheck {
    pub fn custom(
        description: impl Into<String>,
        sql: impl Into<String>,
        expectation: Expectation,
    ) -> Self {
        Self {
            description: description.into(),
            statement: Statement::raw(sql),
            expectation,
        }
    }

    pub fn row_count_positive(table: &str) -> Result<Self, InvalidIdentifier> {
        let statement = StatementBuilder::new()
            .push_sql("SELECT COUNT(*) FROM ")
            .push_ident(table)?
            .build();
        Ok(Self {
            description: "rowcount>0".to_string(),
            statement,
            expectation: Expectation::GreaterThan(0),
        })
    }

    pub fn no_nulls(table: &str, column: &str) -> Result<Self, InvalidIdentifier> {
        let statement = StatementBuilder::new()
            .push_sql("SELECT COUNT(*) FROM ")
            .push_ident(table)?
            .push_sql(" WHERE ")
            .push_ident(column)?
            .push_sql(" IS NULL")
            .build();
        Ok(Self {
            description: format!("no nulls in {column}"),
            statement,
            expectation: Expectation::Equals(0),
        })
    }

    /// `Err` carries the observed value, rendered for the report.
    pub fn evaluate(&self, rows: &RowSet) -> Result<(), String> {
        let Some(value) = rows.first_value() else {
            return Err("no rows".to_string());
        };
        match as_integer(value) {
            Some(actual) if self.expectation.holds(actual) => Ok(()),
            Some(actual) => Err(actual.to_string()),
            None => Err(format!("non-numeric {value}")),
        }
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok())),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub async fn run(gate: &QualityGate, ctx: &RunContext) -> Result<TaskOutput, TaskError> {
    for check in &gate.checks {
        let rows = ctx.warehouse.query(&check.statement).await?;
        if let Err(actual) = check.evaluate(&rows) {
            warn!(
                table = %gate.table,
                check = %check.description,
                actual = %actual,
                "data quality check failed"
            );
            return Err(TaskError::QualityCheckFailed {
                check: check.description.clone(),
                actual,
            });
        }
        info!(table = %gate.table, check = %check.description, "data quality check passed");
    }
    Ok(TaskOutput::Checked {
        passed: gate.checks.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::S3Locators;
    use crate::testing::MockWarehouse;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<MockWarehouse>, RunContext) {
        let warehouse = Arc::new(MockWarehouse::new());
        let ctx = RunContext::new(
            NaiveDate::from_ymd_opt(2018, 11, 1).unwrap(),
            warehouse.clone(),
            Arc::new(S3Locators),
        );
        (warehouse, ctx)
    }

    fn gate(checks: Vec<QualityCheck>) -> QualityGate {
        QualityGate {
            table: "songplays".into(),
            checks,
        }
    }

    #[test]
    fn expectations() {
        assert!(Expectation::GreaterThan(0).holds(1));
        assert!(!Expectation::GreaterThan(0).holds(0));
        assert!(Expectation::Equals(0).holds(0));
        assert!(Expectation::AtMost(5).holds(5));
        assert!(!Expectation::AtMost(5).holds(6));
    }

    #[test]
    fn evaluate_reads_numbers_and_numeric_strings() {
        let check = QualityCheck::row_count_positive("songplays").unwrap();
        assert!(check.evaluate(&RowSet::scalar("count", 3)).is_ok());
        assert!(check.evaluate(&RowSet::scalar("count", "12")).is_ok());
        assert_eq!(check.evaluate(&RowSet::scalar("count", 0)), Err("0".into()));
        assert_eq!(check.evaluate(&RowSet::default()), Err("no rows".into()));
        assert!(check.evaluate(&RowSet::scalar("count", json!(null))).is_err());
    }

    #[test]
    fn no_nulls_query_shape() {
        let check = QualityCheck::no_nulls("users", "userid").unwrap();
        assert_eq!(
            check.statement.sql,
            "SELECT COUNT(*) FROM \"users\" WHERE \"userid\" IS NULL"
        );
        assert_eq!(check.expectation, Expectation::Equals(0));
    }

    #[tokio::test]
    async fn passes_when_table_has_rows() {
        let (warehouse, ctx) = setup();
        warehouse.put_rows("songplays", vec![vec![json!("p1")]]);

        let out = run(
            &gate(vec![QualityCheck::row_count_positive("songplays").unwrap()]),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(out, TaskOutput::Checked { passed: 1 });
    }

    #[tokio::test]
    async fn fails_fast_on_first_failing_check() {
        let (warehouse, ctx) = setup();
        let a = QualityCheck::row_count_positive("songplays").unwrap();
        let b = QualityCheck::no_nulls("songplays", "playid").unwrap();

        let err = run(&gate(vec![a, b]), &ctx).await.unwrap_err();

        assert_eq!(
            err,
            TaskError::QualityCheckFailed {
                check: "rowcount>0".into(),
                actual: "0".into()
            }
        );
        assert_eq!(warehouse.count_matching("IS NULL"), 0);
        assert_eq!(warehouse.statements().len(), 1);
    }

    #[tokio::test]
    async fn never_writes() {
        let (warehouse, ctx) = setup();
        warehouse.put_rows("songplays", vec![vec![json!("p1")]]);
        warehouse.set_query_result("IS NULL", RowSet::scalar("count", 0));

        run(
            &gate(vec![
                QualityCheck::row_count_positive("songplays").unwrap(),
                QualityCheck::no_nulls("songplays", "playid").unwrap(),
            ]),
            &ctx,
        )
        .await
        .unwrap();

        assert!(warehouse.statements().iter().all(|s| s.starts_with("SELECT")));
        assert!(warehouse.transactions().is_empty());
    }
}
