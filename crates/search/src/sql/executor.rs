//! Read-only SQL execution

use super::Row;
use coursewise_common::db::DbPool;
use coursewise_common::errors::{AppError, Result};
use sea_orm::{AccessMode, DbBackend, FromQueryResult, JsonValue, Statement, TransactionTrait};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Relational store executing SELECT text
#[async_trait::async_trait]
pub trait RelationalStore: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;
}

/// Postgres store over the read connection.
///
/// Every query runs in a `READ ONLY` transaction, so statements that slip
/// past the contract checks still cannot write.
pub struct PgStore {
    db: Arc<DbPool>,
}

impl PgStore {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl RelationalStore for PgStore {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let txn = self
            .db
            .read()
            .begin_with_config(None, Some(AccessMode::ReadOnly))
            .await?;
        let records = JsonValue::find_by_statement(Statement::from_string(DbBackend::Postgres, sql))
            .all(&txn)
            .await?;
        txn.commit().await?;

        records
            .into_iter()
            .map(|record| match record {
                JsonValue::Object(map) => Ok(Row::new(map.into_iter().collect())),
                other => Err(AppError::Internal {
                    message: format!("unexpected row shape: {}", other),
                }),
            })
            .collect()
    }
}

/// Scripted store for tests and offline runs; records every query
#[derive(Default)]
pub struct MockStore {
    rows: Vec<Row>,
    queries: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RelationalStore for MockStore {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(sql.to_string());
        }
        Ok(self.rows.clone())
    }
}

/// Executor with a mechanical SELECT gate in front of the store
pub struct SqlExecutor {
    store: Arc<dyn RelationalStore>,
}

impl SqlExecutor {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    /// Execute `sql` if, trimmed and lowercased, it starts with `select`.
    ///
    /// Applied regardless of any upstream validation. Not retried.
    pub async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        let cleaned = sql.trim().to_lowercase();
        if !cleaned.starts_with("select") {
            warn!(sql = %sql, "Refusing to execute non-SELECT statement");
            coursewise_common::metrics::record_sql_rejection("executor_gate");
            return Err(AppError::SafetyViolation {
                message: "only SELECT queries are allowed".to_string(),
            });
        }

        let rows = self.store.query(sql.trim()).await?;
        debug!(rows = rows.len(), "SQL executed");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executor() -> (SqlExecutor, Arc<MockStore>) {
        let store = Arc::new(MockStore::with_rows(vec![Row::new(vec![
            ("course_name".into(), json!("Algorithms")),
            ("avg".into(), json!(78.2)),
        ])]));
        (SqlExecutor::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_non_select_is_safety_violation() {
        let (executor, store) = executor();

        let err = executor.execute("DROP TABLE grades;").await.unwrap_err();
        assert!(matches!(err, AppError::SafetyViolation { .. }));

        let result = executor.execute("  with x as (select 1) delete from grades").await;
        tokio_test::assert_err!(&result);
        assert!(matches!(result, Err(AppError::SafetyViolation { .. })));

        assert!(store.queries().is_empty());
    }

    #[tokio::test]
    async fn test_lowercase_select_is_accepted() {
        let (executor, store) = executor();

        let rows = tokio_test::assert_ok!(executor.execute("select * from grades").await);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("avg"), Some(&json!(78.2)));
        assert_eq!(store.queries(), ["select * from grades"]);
    }
}
