//! Best-effort diagnostic log.
//!
//! Recording an error never fails the caller: a failed insert is reported
//! through `tracing` and dropped.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{error, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ErrorLogEntry {
    pub id: i64,
    pub source: String,
    pub message: String,
    pub detail: Option<String>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ErrorSink {
    pool: SqlitePool,
}

impl ErrorSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record `err` under `source` with an optional context payload.
    pub async fn record(&self, source: &str, err: &(dyn Display + Send + Sync), payload: Option<Value>) {
        self.record_with_detail(source, err, None, payload).await;
    }

    /// Like [`record`](Self::record), with a free-form detail string (for
    /// example the `Debug` rendering of the error chain).
    pub async fn record_with_detail(
        &self,
        source: &str,
        err: &(dyn Display + Send + Sync),
        detail: Option<String>,
        payload: Option<Value>,
    ) {
        let message = err.to_string();
        error!(source = %source, "{}", message);

        if let Err(e) = self.insert(source, &message, detail.as_deref(), payload.as_ref()).await {
            warn!("Failed to write error log for {}: {}", source, e);
        }
    }

    async fn insert(
        &self,
        source: &str,
        message: &str,
        detail: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<(), StoreError> {
        let payload = payload.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"INSERT INTO error_logs (source, message, detail, payload, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(source)
        .bind(message)
        .bind(detail)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<ErrorLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, ErrorLogEntry>(
            r#"SELECT id, source, message, detail, payload, created_at
               FROM error_logs
               ORDER BY id DESC
               LIMIT ?1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
