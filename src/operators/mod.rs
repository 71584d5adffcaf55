//! Kind-specific task bodies. Each is a plain async function over its
//! parameters and the run context.

pub mod load_dimension;
pub mod load_fact;
pub mod quality;
pub mod stage;

use tracing::info;

use crate::sql::{InvalidIdentifier, Statement, StatementBuilder};
use crate::task::{RunContext, SqlScript, TaskOutput};
use crate::TaskError;

impl From<InvalidIdentifier> for TaskError {
    fn from(e: InvalidIdentifier) -> Self {
        TaskError::Misconfigured(e.to_string())
    }
}

/// `INSERT INTO <table> <select>`
pub(crate) fn insert_select(table: &str, select: &str) -> Result<Statement, TaskError> {
    Ok(StatementBuilder::new()
        .push_sql("INSERT INTO ")
        .push_ident(table)?
        .push_sql(" ")
        .push_sql(select.trim().trim_end_matches(';'))
        .build())
}

pub(crate) async fn run_script(
    script: &SqlScript,
    ctx: &RunContext,
) -> Result<TaskOutput, TaskError> {
    if script.statements.is_empty() {
        return Ok(TaskOutput::Nothing);
    }
    let statements: Vec<Statement> = script
        .statements
        .iter()
        .map(|s| Statement::raw(s.trim()))
        .collect();
    info!(statements = statements.len(), "running sql script");
    let rows = ctx.warehouse.execute_in_transaction(&statements).await?;
    Ok(TaskOutput::Loaded { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::S3Locators;
    use crate::testing::MockWarehouse;
    use chrono::NaiveDate;
    use std::sync::Arc;

    #[test]
    fn insert_select_strips_trailing_semicolon() {
        let stmt = insert_select("songplays", "  SELECT * FROM staging_events;\n").unwrap();
        assert_eq!(stmt.sql, "INSERT INTO \"songplays\" SELECT * FROM staging_events");
    }

    #[test]
    fn insert_select_rejects_bad_table() {
        assert!(matches!(
            insert_select("", "SELECT 1"),
            Err(TaskError::Misconfigured(_))
        ));
    }

    #[tokio::test]
    async fn script_runs_in_one_transaction() {
        let warehouse = Arc::new(MockWarehouse::new());
        let ctx = RunContext::new(
            NaiveDate::from_ymd_opt(2018, 11, 1).unwrap(),
            warehouse.clone(),
            Arc::new(S3Locators),
        );
        let script = SqlScript {
            statements: vec![
                "TRUNCATE staging_events".to_string(),
                "TRUNCATE staging_songs".to_string(),
            ],
        };

        run_script(&script, &ctx).await.unwrap();

        let txs = warehouse.transactions();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].len(), 2);
    }
}
