//! Postgres-backed order sequences.
//!
//! Each call is a single upsert statement, so the increment is atomic even
//! with several ledger processes sharing the database.

use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use atelier_orders::PeriodKey;

use super::{SequenceStore, SequenceStoreError};

pub const SEQUENCES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS order_sequences (
    period_key  TEXT PRIMARY KEY,
    last_value  BIGINT NOT NULL CHECK (last_value > 0),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const NEXT_VALUE_SQL: &str = r#"
INSERT INTO order_sequences (period_key, last_value)
VALUES ($1, 1)
ON CONFLICT (period_key) DO UPDATE
    SET last_value = order_sequences.last_value + 1,
        updated_at = NOW()
RETURNING last_value
"#;

#[derive(Debug, Clone)]
pub struct PostgresSequenceStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresSequenceStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub async fn ensure_schema(&self) -> Result<(), SequenceStoreError> {
        sqlx::raw_sql(SEQUENCES_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(period = %period), err)]
    pub async fn next_value_async(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        let row = sqlx::query(NEXT_VALUE_SQL)
            .bind(period.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                // BIGINT overflow on the increment.
                sqlx::Error::Database(db) if db.code().as_deref() == Some("22003") => {
                    SequenceStoreError::Exhausted(period.clone())
                }
                _ => unavailable("next_value", e),
            })?;

        let value: i64 = row
            .try_get("last_value")
            .map_err(|e| unavailable("next_value", e))?;
        u64::try_from(value)
            .map_err(|_| SequenceStoreError::Unavailable(format!("negative sequence value {value}")))
    }

    #[instrument(skip(self), fields(period = %period), err)]
    pub async fn current_value_async(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT last_value FROM order_sequences WHERE period_key = $1")
                .bind(period.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| unavailable("current_value", e))?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }
}

impl SequenceStore for PostgresSequenceStore {
    fn next_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        self.runtime.block_on(self.next_value_async(period))
    }

    fn current_value(&self, period: &PeriodKey) -> Result<u64, SequenceStoreError> {
        self.runtime.block_on(self.current_value_async(period))
    }
}

fn unavailable(operation: &str, err: sqlx::Error) -> SequenceStoreError {
    SequenceStoreError::Unavailable(format!("{operation}: {err}"))
}
