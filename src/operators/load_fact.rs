use tracing::info;

use crate::operators::insert_select;
use crate::sql::StatementBuilder;
use crate::task::{FactLoad, RunContext, TaskOutput};
use crate::TaskError;

/// Appends the transform's rows to the fact table. Without a
/// `delete_window` a rerun over the same staging data duplicates rows.
pub async fn run(load: &FactLoad, ctx: &RunContext) -> Result<TaskOutput, TaskError> {
    let insert = insert_select(&load.table, &load.select)?;

    let rows = match &load.delete_window {
        None => {
            info!(table = %load.table, "appending fact rows");
            ctx.warehouse.execute(&insert).await?
        }
        Some(window) => {
            let delete = StatementBuilder::new()
                .push_sql("DELETE FROM ")
                .push_ident(&load.table)?
                .push_sql(" WHERE ")
                .push_sql(window)
                .build();
            info!(table = %load.table, window = %window, "replacing fact window");
            ctx.warehouse
                .execute_in_transaction(&[delete, insert])
                .await?
        }
    };

    Ok(TaskOutput::Loaded { rows })
}
