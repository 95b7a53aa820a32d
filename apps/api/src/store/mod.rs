//! Data-access layer over PostgreSQL.
//!
//! The runtime only ever talks to the relational store through this module:
//! api keys and scope grants for auth, watermark transactions and injection
//! captures for the detection protocol, usage logs for analytics, and the
//! resume entity tables the CRUD handlers map onto.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::errors::AppError;

/// Closed set of resume entity tables. Table names come from this enum,
/// never from caller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Experience,
    Skill,
    Project,
    Education,
    Certification,
}

impl EntityKind {
    fn table(self) -> &'static str {
        match self {
            EntityKind::Experience => "experience_entries",
            EntityKind::Skill => "skill_entries",
            EntityKind::Project => "project_entries",
            EntityKind::Education => "education_entries",
            EntityKind::Certification => "certification_entries",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resume_id: Option<Uuid>,
    pub permissions: Vec<String>,
    pub scopes: Vec<String>,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub rate_limit: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EntityRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProfileRow {
    pub user_id: Uuid,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WatermarkTransaction {
    pub id: String,
    pub method: String,
    pub credential_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InjectionCapture {
    pub transaction_id: Option<String>,
    pub pattern: Option<String>,
    pub excerpt: String,
    pub confidence: f64,
    pub credential_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub method: String,
    pub credential_id: Option<Uuid>,
    pub duration_ms: i64,
    pub success: bool,
    pub error_code: Option<String>,
}

/// Thin wrapper over the pool; every method is a single query.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ── api keys & scopes ───────────────────────────────────────────────

    /// Looks up a credential by its opaque key string. Returns rows for
    /// revoked/expired keys too; the auth service decides how to reject.
    pub async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRow>, AppError> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT id, user_id, resume_id, permissions, scopes, revoked, expires_at, rate_limit
             FROM api_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Permission patterns inherited through the named scopes.
    pub async fn scope_patterns(&self, scopes: &[String]) -> Result<Vec<String>, AppError> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }
        let patterns: Vec<(String,)> = sqlx::query_as(
            "SELECT pattern FROM permission_scopes WHERE name = ANY($1) ORDER BY pattern",
        )
        .bind(scopes)
        .fetch_all(&self.pool)
        .await?;
        Ok(patterns.into_iter().map(|(p,)| p).collect())
    }

    // ── watermark bookkeeping ───────────────────────────────────────────

    pub async fn insert_watermark_transaction(
        &self,
        tx: &WatermarkTransaction,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO watermark_transactions (id, method, credential_id, created_at, expires_at)
             VALUES ($1, $2, $3, now(), $4)",
        )
        .bind(&tx.id)
        .bind(&tx.method)
        .bind(tx.credential_id)
        .bind(tx.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically consumes a live transaction: deletes it and reports
    /// whether a matching unexpired row existed. A given id can therefore
    /// trigger detection at most once.
    pub async fn consume_watermark_transaction(
        &self,
        id: &str,
        credential_id: Uuid,
    ) -> Result<bool, AppError> {
        let deleted: Option<(String,)> = sqlx::query_as(
            "DELETE FROM watermark_transactions
             WHERE id = $1 AND credential_id = $2 AND expires_at > now()
             RETURNING id",
        )
        .bind(id)
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deleted.is_some())
    }

    /// Reclaims expired, never-matched transactions.
    pub async fn purge_expired_transactions(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM watermark_transactions WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_injection_capture(
        &self,
        capture: &InjectionCapture,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO injection_captures
               (id, transaction_id, pattern, excerpt, confidence, credential_id, request_id,
                reviewed, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, false, now())",
        )
        .bind(Uuid::new_v4())
        .bind(&capture.transaction_id)
        .bind(&capture.pattern)
        .bind(&capture.excerpt)
        .bind(capture.confidence)
        .bind(capture.credential_id)
        .bind(capture.request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── usage logging ───────────────────────────────────────────────────

    pub async fn insert_usage_log(&self, record: &UsageRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO usage_logs
               (id, request_id, method, credential_id, duration_ms, success, error_code, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, now())",
        )
        .bind(Uuid::new_v4())
        .bind(record.request_id)
        .bind(&record.method)
        .bind(record.credential_id)
        .bind(record.duration_ms)
        .bind(record.success)
        .bind(&record.error_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── resume entities (thin data mappers) ─────────────────────────────

    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRow>, AppError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT user_id, data, updated_at FROM profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_profile(&self, user_id: Uuid, data: &Value) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO profiles (user_id, data, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (user_id) DO UPDATE SET data = $2, updated_at = now()",
        )
        .bind(user_id)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_entities(
        &self,
        kind: EntityKind,
        user_id: Uuid,
    ) -> Result<Vec<EntityRow>, AppError> {
        let query = format!(
            "SELECT id, user_id, data, created_at, updated_at FROM {}
             WHERE user_id = $1 ORDER BY created_at DESC",
            kind.table()
        );
        let rows = sqlx::query_as::<_, EntityRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn insert_entity(
        &self,
        kind: EntityKind,
        user_id: Uuid,
        data: &Value,
    ) -> Result<EntityRow, AppError> {
        let query = format!(
            "INSERT INTO {} (id, user_id, data, created_at, updated_at)
             VALUES ($1, $2, $3, now(), now())
             RETURNING id, user_id, data, created_at, updated_at",
            kind.table()
        );
        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(data)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn update_entity(
        &self,
        kind: EntityKind,
        user_id: Uuid,
        id: Uuid,
        data: &Value,
    ) -> Result<EntityRow, AppError> {
        let query = format!(
            "UPDATE {} SET data = $3, updated_at = now()
             WHERE id = $1 AND user_id = $2
             RETURNING id, user_id, data, created_at, updated_at",
            kind.table()
        );
        sqlx::query_as::<_, EntityRow>(&query)
            .bind(id)
            .bind(user_id)
            .bind(data)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("entity {id}")))
    }

    pub async fn delete_entity(
        &self,
        kind: EntityKind,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<(), AppError> {
        let query = format!("DELETE FROM {} WHERE id = $1 AND user_id = $2", kind.table());
        let result = sqlx::query(&query)
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("entity {id}")));
        }
        Ok(())
    }
}

/// Default lifetime of a watermark transaction.
pub fn watermark_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::hours(24)
}
