use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// One-time value (email verification, password reset) bound to an identifier.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Verification {
    pub id: Uuid,
    pub identifier: String,
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const VERIFICATION_COLUMNS: &str = "id, identifier, value, expires_at, created_at, updated_at";

impl Verification {
    pub async fn create(
        pool: &SqlitePool,
        identifier: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Verification>(&format!(
            "INSERT INTO verifications (id, identifier, value, expires_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             RETURNING {VERIFICATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(identifier)
        .bind(value)
        .bind(expires_at)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_latest(
        pool: &SqlitePool,
        identifier: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Verification>(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM verifications
             WHERE identifier = $1
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(identifier)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM verifications WHERE expires_at < $1")
            .bind(now)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
