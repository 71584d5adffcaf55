use tracing::info;

use crate::client::{Locator, ObjectStoreError, WarehouseError};
use crate::sql::{Statement, StatementBuilder};
use crate::task::{RunContext, StageLoad, TaskOutput};
use crate::TaskError;

/// Copies JSON records under the resolved prefix into the staging table.
/// The load is additive; reruns rely on an earlier truncation step.
pub async fn run(load: &StageLoad, ctx: &RunContext) -> Result<TaskOutput, TaskError> {
    let locator = ctx
        .object_store
        .resolve_locator(&load.bucket, &load.key_pattern, &ctx.template_params())
        .await
        .map_err(|e| match e {
            ObjectStoreError::Unreachable(msg) => TaskError::SourceUnreachable(msg),
            ObjectStoreError::InvalidPattern(msg) => TaskError::Misconfigured(msg),
        })?;

    let statement = copy_statement(load, &locator)?;
    info!(table = %load.table, source = %locator, "copying staged records");

    let rows = ctx
        .warehouse
        .execute(&statement)
        .await
        .map_err(|e| match e {
            WarehouseError::Transient(msg) => TaskError::SourceUnreachable(msg),
            WarehouseError::Rejected(msg) => TaskError::LoadRejected(msg),
        })?;

    Ok(TaskOutput::Staged { locator, rows })
}

pub fn copy_statement(load: &StageLoad, locator: &Locator) -> Result<Statement, TaskError> {
    let mut builder = StatementBuilder::new()
        .push_sql("COPY ")
        .push_ident(&load.table)?
        .push_sql(" FROM ")
        .push_bind(locator.as_str());
    if let Some(role) = &load.iam_role {
        builder = builder.push_sql(" IAM_ROLE ").push_bind(role.as_str());
    }
    Ok(builder
        .push_sql(" IGNOREHEADER ")
        .push_bind(load.ignore_header)
        .push_sql(" REGION AS ")
        .push_bind(load.region.as_str())
        .push_sql(" FORMAT AS JSON ")
        .push_bind(load.json_paths.as_str())
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::S3Locators;
    use crate::testing::{MockObjectStore, MockWarehouse};
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Arc;

    fn events() -> StageLoad {
        StageLoad::new("staging_events", "akwayaga", "log-data/{year}/{month}", "us-west-2")
    }

    fn ctx(
        warehouse: Arc<MockWarehouse>,
        store: Arc<MockObjectStore<S3Locators>>,
    ) -> RunContext {
        RunContext::new(NaiveDate::from_ymd_opt(2018, 11, 1).unwrap(), warehouse, store)
    }

    #[test]
    fn copy_binds_every_value() {
        let stmt = copy_statement(&events(), &Locator("s3://akwayaga/log-data".into())).unwrap();
        assert_eq!(
            stmt.sql,
            "COPY \"staging_events\" FROM $1 IGNOREHEADER $2 REGION AS $3 FORMAT AS JSON $4"
        );
        assert_eq!(
            stmt.render_inline(),
            "COPY \"staging_events\" FROM 's3://akwayaga/log-data' IGNOREHEADER 1 \
             REGION AS 'us-west-2' FORMAT AS JSON 'auto'"
        );
    }

    #[test]
    fn iam_role_is_bound_not_interpolated() {
        let mut load = events();
        load.iam_role = Some("arn:aws:iam::1:role/x' --".into());
        let stmt = copy_statement(&load, &Locator("s3://b/k".into())).unwrap();
        assert!(stmt.sql.contains("IAM_ROLE $2"));
        assert!(stmt.render_inline().contains("'arn:aws:iam::1:role/x'' --'"));
    }

    #[tokio::test]
    async fn resolves_run_date_into_locator() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.set_source_rows("s3://akwayaga/log-data/2018/11", vec![vec![json!("e1")]]);
        let store = Arc::new(MockObjectStore::new(S3Locators));

        let out = run(&events(), &ctx(warehouse.clone(), store.clone()))
            .await
            .unwrap();

        assert_eq!(
            out,
            TaskOutput::Staged {
                locator: Locator("s3://akwayaga/log-data/2018/11".into()),
                rows: 1
            }
        );
        assert_eq!(warehouse.table("staging_events").len(), 1);
        assert_eq!(store.resolved().len(), 1);
    }

    #[tokio::test]
    async fn rejected_copy_is_load_rejected() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_next("COPY", WarehouseError::Rejected("invalid JSON".into()));
        let store = Arc::new(MockObjectStore::new(S3Locators));

        let err = run(&events(), &ctx(warehouse, store)).await.unwrap_err();
        assert_eq!(err, TaskError::LoadRejected("invalid JSON".into()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_source_is_retryable() {
        let warehouse = Arc::new(MockWarehouse::new());
        let store = Arc::new(MockObjectStore::new(S3Locators));
        store.fail_next(ObjectStoreError::Unreachable("dns".into()));

        let err = run(&events(), &ctx(warehouse.clone(), store))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::SourceUnreachable("dns".into()));
        assert!(err.is_retryable());
        assert!(warehouse.statements().is_empty());
    }

    #[tokio::test]
    async fn unknown_placeholder_is_misconfigured() {
        let mut load = events();
        load.key_pattern = "log-data/{hour}".into();
        let err = run(
            &load,
            &ctx(
                Arc::new(MockWarehouse::new()),
                Arc::new(MockObjectStore::new(S3Locators)),
            ),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::Misconfigured(_)));
    }
}
