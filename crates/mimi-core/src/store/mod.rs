//! SQLite persistence.
//!
//! Every store wraps a clone of one shared [`SqlitePool`]. Each method issues
//! independent, individually committed statements; nothing here opens a
//! multi-statement transaction.

pub mod error_log;
pub mod eula;
pub mod history;
pub mod meals;
pub mod users;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::StoreError;

pub use error_log::{ErrorLogEntry, ErrorSink};
pub use eula::{ConsentStatus, EulaStore, EulaVersion, NewConsent, NewEulaVersion};
pub use history::{ChatTurn, HistoryEntry, HistoryStore, NewChatTurn};
pub use meals::{MealLog, MealLogStore, NewMealLog};
pub use users::UserDirectory;

/// Handle to the database and factory for the individual stores.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to `url` (e.g. `sqlite://mimi.db` or `sqlite::memory:`),
    /// creating the database file if it does not exist.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives and dies with its connection, so the
        // pool must hold exactly one and never recycle it.
        let pool = if is_memory_url(url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            // Concurrent webhook handlers write through separate connections.
            let options = options
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };

        debug!("Connected to SQLite database at {}", url);
        Ok(Self { pool })
    }

    /// Fresh, migrated in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = Self::connect("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn users(&self) -> UserDirectory {
        UserDirectory::new(self.pool.clone())
    }

    pub fn eula(&self) -> EulaStore {
        EulaStore::new(self.pool.clone())
    }

    pub fn history(&self) -> HistoryStore {
        HistoryStore::new(self.pool.clone())
    }

    pub fn meals(&self) -> MealLogStore {
        MealLogStore::new(self.pool.clone())
    }

    pub fn error_sink(&self) -> ErrorSink {
        ErrorSink::new(self.pool.clone())
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_memory_url() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://file?mode=memory"));
        assert!(!is_memory_url("sqlite://mimi.db"));
    }

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::in_memory().await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        for expected in ["chat_logs", "error_logs", "eula_consents", "eula_versions", "meal_logs", "users"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn test_file_database_persists_across_connections() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("mimi.db").display());

        let db = Database::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        let id = db.users().resolve_or_create("U-file").await.unwrap();
        db.pool().close().await;

        let reopened = Database::connect(&url).await.unwrap();
        reopened.migrate().await.unwrap();
        assert_eq!(reopened.users().find("U-file").await.unwrap(), Some(id));
    }
}
