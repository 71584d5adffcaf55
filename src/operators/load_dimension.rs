use tracing::info;

use crate::operators::insert_select;
use crate::sql::{Statement, StatementBuilder};
use crate::task::{DimensionLoad, RunContext, TaskOutput};
use crate::TaskError;

/// Loads a dimension table.
///
/// With `replace` the clear and the insert commit as one transaction, so a
/// concurrent reader sees either the old rows or the new ones, never an
/// empty table. The clear is a `DELETE` because `TRUNCATE` commits
/// implicitly on several warehouses.
pub async fn run(load: &DimensionLoad, ctx: &RunContext) -> Result<TaskOutput, TaskError> {
    let insert = insert_select(&load.table, &load.select)?;

    let rows = if load.replace {
        info!(table = %load.table, "replacing dimension rows");
        ctx.warehouse
            .execute_in_transaction(&[clear_statement(&load.table)?, insert])
            .await?
    } else {
        info!(table = %load.table, "appending dimension rows");
        ctx.warehouse.execute(&insert).await?
    };

    Ok(TaskOutput::Loaded { rows })
}

fn clear_statement(table: &str) -> Result<Statement, TaskError> {
    Ok(StatementBuilder::new()
        .push_sql("DELETE FROM ")
        .push_ident(table)?
        .build())
}
