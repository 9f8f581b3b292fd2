use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::StoreError;

/// A published version of the end-user license agreement.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct EulaVersion {
    pub id: i64,
    pub version: String,
    pub url: String,
    pub effective_from: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Administrative input for a new EULA version.
#[derive(Debug, Clone)]
pub struct NewEulaVersion {
    pub version: String,
    pub url: String,
    pub effective_from: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewEulaVersion {
    pub fn new(version: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            url: url.into(),
            effective_from: None,
            created_at: Utc::now(),
        }
    }

    pub fn effective_from(mut self, at: DateTime<Utc>) -> Self {
        self.effective_from = Some(at);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// Result of the consent gate check.
#[derive(Debug, Clone)]
pub struct ConsentStatus {
    pub agreed: bool,
    /// `None` when no version is configured; the gate is then open.
    pub latest: Option<EulaVersion>,
}

/// Audit fields captured when a user agrees.
#[derive(Debug, Clone)]
pub struct NewConsent {
    pub user_id: i64,
    pub eula_version_id: i64,
    /// Defaults to the time of recording.
    pub accepted_at: Option<DateTime<Utc>>,
    pub channel: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Consent ledger: EULA versions and who agreed to which.
#[derive(Clone)]
pub struct EulaStore {
    pool: SqlitePool,
}

impl EulaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new version. Versions are never edited afterwards.
    pub async fn create_version(&self, new: &NewEulaVersion) -> Result<EulaVersion, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO eula_versions (version, url, effective_from, created_at)
               VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(&new.version)
        .bind(&new.url)
        .bind(new.effective_from)
        .bind(new.created_at)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!("Created EULA version {} ({}) as id {}", new.version, new.url, id);

        Ok(EulaVersion {
            id,
            version: new.version.clone(),
            url: new.url.clone(),
            effective_from: new.effective_from,
            created_at: new.created_at,
        })
    }

    /// The version with the greatest `(coalesce(effective_from, created_at), id)`.
    pub async fn latest_version(&self) -> Result<Option<EulaVersion>, StoreError> {
        let latest = sqlx::query_as::<_, EulaVersion>(
            r#"SELECT id, version, url, effective_from, created_at
               FROM eula_versions
               ORDER BY COALESCE(effective_from, created_at) DESC, id DESC
               LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest)
    }

    /// Whether `user_id` agreed to the latest version. With no version
    /// configured the answer is always yes.
    pub async fn has_agreed_to_latest(&self, user_id: i64) -> Result<ConsentStatus, StoreError> {
        let Some(latest) = self.latest_version().await? else {
            return Ok(ConsentStatus {
                agreed: true,
                latest: None,
            });
        };

        let agreed = self.has_consent(user_id, latest.id).await?;
        Ok(ConsentStatus {
            agreed,
            latest: Some(latest),
        })
    }

    pub async fn has_consent(&self, user_id: i64, eula_version_id: i64) -> Result<bool, StoreError> {
        let existing = sqlx::query_scalar::<_, i64>(
            r#"SELECT id FROM eula_consents
               WHERE user_id = ?1 AND eula_version_id = ?2
               LIMIT 1"#,
        )
        .bind(user_id)
        .bind(eula_version_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(existing.is_some())
    }

    /// Record that a user agreed to a version. Returns `true` when a record
    /// already existed, in which case nothing is written.
    pub async fn record_consent(&self, consent: &NewConsent) -> Result<bool, StoreError> {
        if self.has_consent(consent.user_id, consent.eula_version_id).await? {
            debug!(
                "User {} already agreed to EULA {}",
                consent.user_id, consent.eula_version_id
            );
            return Ok(true);
        }

        let accepted_at = consent.accepted_at.unwrap_or_else(Utc::now);
        let result = sqlx::query(
            r#"INSERT INTO eula_consents
                 (user_id, eula_version_id, accepted_at, channel, ip_address, user_agent)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT (user_id, eula_version_id) DO NOTHING"#,
        )
        .bind(consent.user_id)
        .bind(consent.eula_version_id)
        .bind(accepted_at)
        .bind(&consent.channel)
        .bind(&consent.ip_address)
        .bind(&consent.user_agent)
        .execute(&self.pool)
        .await?;

        let already = result.rows_affected() == 0;
        if !already {
            info!(
                "User {} agreed to EULA {} via {}",
                consent.user_id, consent.eula_version_id, consent.channel
            );
        }
        Ok(already)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use chrono::{Duration, TimeZone};

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, n, 0, 0, 0).unwrap()
    }

    fn consent(user_id: i64, eula_version_id: i64) -> NewConsent {
        NewConsent {
            user_id,
            eula_version_id,
            accepted_at: None,
            channel: "liff".to_string(),
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_latest_none_when_unconfigured() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.eula().latest_version().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_prefers_greatest_effective_date() {
        let db = Database::in_memory().await.unwrap();
        let eula = db.eula();

        let _a = eula
            .create_version(&NewEulaVersion::new("A", "https://x/a").effective_from(day(1)).created_at(day(1)))
            .await
            .unwrap();
        let _b = eula
            .create_version(&NewEulaVersion::new("B", "https://x/b").created_at(day(2)))
            .await
            .unwrap();
        let c = eula
            .create_version(&NewEulaVersion::new("C", "https://x/c").effective_from(day(3)).created_at(day(1)))
            .await
            .unwrap();

        let latest = eula.latest_version().await.unwrap().unwrap();
        assert_eq!(latest.id, c.id);
        assert_eq!(latest.version, "C");
    }

    #[tokio::test]
    async fn test_latest_falls_back_to_created_at_over_lower_id() {
        let db = Database::in_memory().await.unwrap();
        let eula = db.eula();

        // B gets the lower id but its created_at (day 2) beats A's effective day 1.
        let b = eula
            .create_version(&NewEulaVersion::new("B", "https://x/b").created_at(day(2)))
            .await
            .unwrap();
        let a = eula
            .create_version(&NewEulaVersion::new("A", "https://x/a").effective_from(day(1)).created_at(day(5)))
            .await
            .unwrap();
        assert!(b.id < a.id);

        let latest = eula.latest_version().await.unwrap().unwrap();
        assert_eq!(latest.version, "B");
    }

    #[tokio::test]
    async fn test_latest_tie_broken_by_id() {
        let db = Database::in_memory().await.unwrap();
        let eula = db.eula();

        eula.create_version(&NewEulaVersion::new("first", "https://x/1").created_at(day(4)))
            .await
            .unwrap();
        let second = eula
            .create_version(&NewEulaVersion::new("second", "https://x/2").created_at(day(4)))
            .await
            .unwrap();

        assert_eq!(eula.latest_version().await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_gate_open_without_versions() {
        let db = Database::in_memory().await.unwrap();
        let user = db.users().resolve_or_create("U1").await.unwrap();

        let status = db.eula().has_agreed_to_latest(user).await.unwrap();
        assert!(status.agreed);
        assert!(status.latest.is_none());
    }

    #[tokio::test]
    async fn test_gate_closed_until_consent_recorded() {
        let db = Database::in_memory().await.unwrap();
        let eula = db.eula();
        let user = db.users().resolve_or_create("U1").await.unwrap();
        let v = eula.create_version(&NewEulaVersion::new("V1", "https://x/v1")).await.unwrap();

        let status = eula.has_agreed_to_latest(user).await.unwrap();
        assert!(!status.agreed);
        assert_eq!(status.latest.as_ref().map(|l| l.id), Some(v.id));

        assert!(!eula.record_consent(&consent(user, v.id)).await.unwrap());
        assert!(eula.has_agreed_to_latest(user).await.unwrap().agreed);
    }

    #[tokio::test]
    async fn test_new_version_reopens_gate() {
        let db = Database::in_memory().await.unwrap();
        let eula = db.eula();
        let user = db.users().resolve_or_create("U1").await.unwrap();

        let v1 = eula
            .create_version(&NewEulaVersion::new("V1", "https://x/v1").created_at(Utc::now() - Duration::days(10)))
            .await
            .unwrap();
        eula.record_consent(&consent(user, v1.id)).await.unwrap();
        assert!(eula.has_agreed_to_latest(user).await.unwrap().agreed);

        eula.create_version(&NewEulaVersion::new("V2", "https://x/v2")).await.unwrap();
        let status = eula.has_agreed_to_latest(user).await.unwrap();
        assert!(!status.agreed);
        assert_eq!(status.latest.unwrap().version, "V2");
    }

    #[tokio::test]
    async fn test_record_consent_twice_writes_one_row() {
        let db = Database::in_memory().await.unwrap();
        let eula = db.eula();
        let user = db.users().resolve_or_create("U1").await.unwrap();
        let v = eula.create_version(&NewEulaVersion::new("V1", "https://x/v1")).await.unwrap();

        assert!(!eula.record_consent(&consent(user, v.id)).await.unwrap());
        assert!(eula.record_consent(&consent(user, v.id)).await.unwrap());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM eula_consents WHERE user_id = ?1")
            .bind(user)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_record_consent_keeps_audit_fields() {
        let db = Database::in_memory().await.unwrap();
        let eula = db.eula();
        let user = db.users().resolve_or_create("U1").await.unwrap();
        let v = eula.create_version(&NewEulaVersion::new("V1", "https://x/v1")).await.unwrap();

        let mut c = consent(user, v.id);
        c.accepted_at = Some(day(7));
        eula.record_consent(&c).await.unwrap();

        let (accepted_at, channel, ip, ua): (DateTime<Utc>, String, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT accepted_at, channel, ip_address, user_agent FROM eula_consents WHERE user_id = ?1",
        )
        .bind(user)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(accepted_at, day(7));
        assert_eq!(channel, "liff");
        assert_eq!(ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(ua.as_deref(), Some("Mozilla/5.0"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consent_records_once() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::connect(&format!("sqlite://{}", tmp.path().join("race.db").display()))
            .await
            .unwrap();
        db.migrate().await.unwrap();
        let user = db.users().resolve_or_create("U-race").await.unwrap();
        let v = db.eula().create_version(&NewEulaVersion::new("V1", "https://x/v1")).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let eula = db.eula();
                let c = consent(user, v.id);
                tokio::spawn(async move { eula.record_consent(&c).await })
            })
            .collect();
        let mut already = Vec::new();
        for handle in handles {
            already.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(already.iter().filter(|a| !**a).count(), 1);
        assert_eq!(already.iter().filter(|a| **a).count(), 15);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM eula_consents")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }
}
