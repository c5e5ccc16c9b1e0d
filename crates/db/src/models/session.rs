use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Persisted login session. `token` is the unsigned half of the session cookie.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSession {
    pub user_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

const SESSION_COLUMNS: &str =
    "id, token, user_id, expires_at, ip_address, user_agent, created_at, updated_at";

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub async fn create(pool: &SqlitePool, data: &CreateSession) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO sessions (id, token, user_id, expires_at, ip_address, user_agent, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&data.token)
        .bind(data.user_id)
        .bind(data.expires_at)
        .bind(&data.ip_address)
        .bind(&data.user_agent)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_token(pool: &SqlitePool, token: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(pool)
        .await
    }

    pub async fn extend(
        pool: &SqlitePool,
        id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sessions SET expires_at = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(expires_at)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_token(pool: &SqlitePool, token: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        DBService,
        models::user::{CreateUser, User},
    };

    async fn user(db: &DBService) -> User {
        User::create(
            &db.pool,
            &CreateUser {
                name: "Grace".to_string(),
                email: "grace@example.com".to_string(),
                image: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn delete_expired_keeps_live_sessions() {
        let db = DBService::new_in_memory().await.unwrap();
        let user = user(&db).await;
        let now = Utc::now();

        for (token, offset) in [("old", -Duration::hours(1)), ("live", Duration::hours(1))] {
            Session::create(
                &db.pool,
                &CreateSession {
                    user_id: user.id,
                    token: token.to_string(),
                    expires_at: now + offset,
                    ip_address: None,
                    user_agent: None,
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(Session::delete_expired(&db.pool, now).await.unwrap(), 1);
        assert!(Session::find_by_token(&db.pool, "old").await.unwrap().is_none());
        assert!(Session::find_by_token(&db.pool, "live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn extend_moves_expiry() {
        let db = DBService::new_in_memory().await.unwrap();
        let user = user(&db).await;
        let session = Session::create(
            &db.pool,
            &CreateSession {
                user_id: user.id,
                token: "tok".to_string(),
                expires_at: Utc::now() + Duration::minutes(5),
                ip_address: Some("127.0.0.1".to_string()),
                user_agent: None,
            },
        )
        .await
        .unwrap();

        let later = Utc::now() + Duration::days(7);
        Session::extend(&db.pool, session.id, later).await.unwrap();
        let reloaded = Session::find_by_token(&db.pool, "tok").await.unwrap().unwrap();
        assert_eq!(reloaded.expires_at, later);
        assert_eq!(reloaded.ip_address.as_deref(), Some("127.0.0.1"));
    }
}
