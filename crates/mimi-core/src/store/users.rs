use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::StoreError;

/// A user row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub line_user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Maps LINE identities to internal numeric user ids.
#[derive(Clone)]
pub struct UserDirectory {
    pool: SqlitePool,
}

impl UserDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up the internal id for a LINE identity.
    pub async fn find(&self, line_user_id: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE line_user_id = ?1")
            .bind(line_user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, line_user_id, created_at, updated_at FROM users WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Return the internal id for `line_user_id`, creating the user on first
    /// contact.
    ///
    /// The unique index on `line_user_id` turns a concurrent first contact
    /// into a no-op insert; both callers then read back the same row.
    pub async fn resolve_or_create(&self, line_user_id: &str) -> Result<i64, StoreError> {
        if line_user_id.is_empty() {
            return Err(StoreError::Invalid("empty LINE user id".to_string()));
        }

        if let Some(id) = self.find(line_user_id).await? {
            return Ok(id);
        }

        let now = Utc::now();
        let inserted = sqlx::query(
            r#"INSERT INTO users (line_user_id, created_at, updated_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT (line_user_id) DO NOTHING"#,
        )
        .bind(line_user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = self.find(line_user_id).await?.ok_or_else(|| {
            StoreError::Integrity(format!("user {line_user_id} missing after insert"))
        })?;

        if inserted.rows_affected() == 0 {
            debug!("User {} was created concurrently; re-read id {}", line_user_id, id);
        } else {
            info!("Created user {} for LINE identity {}", id, line_user_id);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Database;

    #[tokio::test]
    async fn test_resolve_or_create_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let users = db.users();

        let first = users.resolve_or_create("U123").await.unwrap();
        let second = users.resolve_or_create("U123").await.unwrap();
        assert_eq!(first, second);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_distinct_identities_get_distinct_ids() {
        let db = Database::in_memory().await.unwrap();
        let users = db.users();

        let a = users.resolve_or_create("Ua").await.unwrap();
        let b = users.resolve_or_create("Ub").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_new_user_timestamps_match() {
        let db = Database::in_memory().await.unwrap();
        let users = db.users();

        let id = users.resolve_or_create("Uts").await.unwrap();
        let user = users.get(id).await.unwrap().unwrap();
        assert_eq!(user.line_user_id, "Uts");
        assert_eq!(user.created_at, user.updated_at);
    }

    #[tokio::test]
    async fn test_find_unknown_identity() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.users().find("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.users().resolve_or_create("").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_contact_creates_one_user() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::connect(&format!("sqlite://{}", tmp.path().join("race.db").display()))
            .await
            .unwrap();
        db.migrate().await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let users = db.users();
                tokio::spawn(async move { users.resolve_or_create("U-race").await })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }

        assert!(ids.iter().all(|id| *id == ids[0]));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
