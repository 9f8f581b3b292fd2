use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{Direction, IntentCategory};

/// A logged conversation turn as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChatTurn {
    pub id: i64,
    pub user_id: i64,
    pub session_id: Option<String>,
    pub direction: String,
    pub message_type: String,
    pub text_content: String,
    pub created_at: DateTime<Utc>,
    pub intent_category: Option<String>,
}

/// What the conversation context needs from a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub text: String,
}

/// A turn to append.
#[derive(Debug, Clone)]
pub struct NewChatTurn {
    pub user_id: i64,
    pub session_id: Option<String>,
    pub direction: Direction,
    pub text: String,
    pub intent_category: Option<IntentCategory>,
    pub created_at: DateTime<Utc>,
}

impl NewChatTurn {
    pub fn user(user_id: i64, text: impl Into<String>, category: IntentCategory) -> Self {
        Self {
            user_id,
            session_id: None,
            direction: Direction::User,
            text: text.into(),
            intent_category: Some(category),
            created_at: Utc::now(),
        }
    }

    pub fn bot(user_id: i64, text: impl Into<String>) -> Self {
        Self {
            user_id,
            session_id: None,
            direction: Direction::Bot,
            text: text.into(),
            intent_category: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// Append-only per-user conversation log.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one turn and return its row id.
    pub async fn append(&self, turn: &NewChatTurn) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO chat_logs
                 (user_id, session_id, direction, message_type, text_content, created_at, intent_category)
               VALUES (?1, ?2, ?3, 'text', ?4, ?5, ?6)"#,
        )
        .bind(turn.user_id)
        .bind(&turn.session_id)
        .bind(turn.direction.as_str())
        .bind(&turn.text)
        .bind(turn.created_at)
        .bind(turn.intent_category.map(|c| c.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Turns from the trailing `window_hours`, oldest first.
    pub async fn recent_turns(&self, user_id: i64, window_hours: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        let cutoff = Duration::try_hours(window_hours)
            .filter(|window| *window >= Duration::zero())
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| StoreError::Invalid(format!("history window of {window_hours}h is out of range")))?;
        let turns = self.turns_since(user_id, cutoff).await?;
        debug!(
            "Loaded {} history turns for user {} (last {}h)",
            turns.len(),
            user_id,
            window_hours
        );

        Ok(turns
            .into_iter()
            .filter_map(|t| match Direction::parse(&t.direction) {
                Some(direction) => Some(HistoryEntry {
                    direction,
                    text: t.text_content,
                }),
                None => {
                    warn!("Skipping chat log {} with direction {:?}", t.id, t.direction);
                    None
                }
            })
            .collect())
    }

    /// Every turn created at or after `cutoff`, in insertion order.
    pub async fn turns_since(&self, user_id: i64, cutoff: DateTime<Utc>) -> Result<Vec<ChatTurn>, StoreError> {
        let turns = sqlx::query_as::<_, ChatTurn>(
            r#"SELECT id, user_id, session_id, direction, message_type, text_content, created_at, intent_category
               FROM chat_logs
               WHERE user_id = ?1 AND created_at >= ?2
               ORDER BY id ASC"#,
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(turns)
    }

    pub async fn count(&self, user_id: i64) -> Result<i64, StoreError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chat_logs WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
