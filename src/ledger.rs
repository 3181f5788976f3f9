//! Durable result store.
//!
//! One relational table, `computation_results`, upserted by `request_id`.
//! This is the source of truth for results: waiters and WebSocket
//! broadcasts are best-effort, the ledger row is what a caller can always
//! poll back after a timeout or a disconnect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::PostgresConfig;
use crate::record::ResultRecord;

/// Upper bound on pooled connections to the ledger database.
const MAX_CONNECTIONS: u32 = 20;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// A persisted result, as returned to polling clients.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    #[serde(skip_serializing)]
    pub id: i64,
    pub request_id: String,
    pub correlation_id: String,
    pub status: String,
    pub result_data: Option<String>,
    pub computed_at: DateTime<Utc>,
    pub processing_time_ms: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Grouped status counts for the stats endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// Handle to the results table. Cheap to clone; the pool is shared.
#[derive(Clone)]
pub struct ResultLedger {
    pool: PgPool,
}

impl ResultLedger {
    /// Connect with a bounded pool and make sure the table exists.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.url())
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;

        info!(
            host = %config.host,
            database = %config.database,
            max_connections = MAX_CONNECTIONS,
            "Result ledger connected"
        );
        Ok(ledger)
    }

    /// For tests and tools that already hold a pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS computation_results (
                id                 BIGSERIAL PRIMARY KEY,
                request_id         TEXT NOT NULL UNIQUE,
                correlation_id     TEXT NOT NULL,
                status             TEXT NOT NULL
                    CHECK (status IN ('SUCCESS', 'ERROR', 'TIMEOUT')),
                result_data        TEXT,
                computed_at        TIMESTAMPTZ NOT NULL,
                processing_time_ms INTEGER,
                error_message      TEXT,
                created_at         TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS computation_results_correlation_id_idx \
             ON computation_results (correlation_id)",
            "CREATE INDEX IF NOT EXISTS computation_results_computed_at_idx \
             ON computation_results (computed_at)",
            "CREATE INDEX IF NOT EXISTS computation_results_status_idx \
             ON computation_results (status)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Insert or overwrite the row for this result's `request_id`.
    ///
    /// A later result for the same request wins; the correlation id is
    /// treated as immutable and left untouched on conflict. Duplicate
    /// deliveries from the at-least-once log therefore collapse into a
    /// single row.
    pub async fn upsert_result(&self, result: &ResultRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO computation_results
                (request_id, correlation_id, status, result_data,
                 computed_at, processing_time_ms, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (request_id) DO UPDATE SET
                status             = EXCLUDED.status,
                result_data        = EXCLUDED.result_data,
                computed_at        = EXCLUDED.computed_at,
                processing_time_ms = EXCLUDED.processing_time_ms,
                error_message      = EXCLUDED.error_message
            "#,
        )
        .bind(&result.request_id)
        .bind(&result.correlation_id)
        .bind(result.status.as_str())
        .bind(&result.payload)
        .bind(result.computed_at)
        .bind(result.processing_time_ms.map(|ms| ms as i32))
        .bind(&result.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Exact lookup by request id.
    pub async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<ResultRow>, LedgerError> {
        let row = sqlx::query_as::<_, ResultRow>(
            "SELECT * FROM computation_results WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Status counts for rows inserted within the trailing `window`.
    pub async fn stats_since(&self, window: Duration) -> Result<Vec<StatusCount>, LedgerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));

        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM computation_results \
             WHERE created_at > $1 GROUP BY status ORDER BY status",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StatusCount {
                status: row.get("status"),
                count: row.get("count"),
            })
            .collect())
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_row_serializes_camel_case_without_surrogate_key() {
        let row = ResultRow {
            id: 7,
            request_id: "r-1".into(),
            correlation_id: "c-1".into(),
            status: "SUCCESS".into(),
            result_data: Some("{\"bac\":0.04}".into()),
            computed_at: Utc::now(),
            processing_time_ms: Some(12),
            error_message: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["requestId"], "r-1");
        assert_eq!(json["processingTimeMs"], 12);
        assert!(json["errorMessage"].is_null());
    }
}
