use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct SessionUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub image: Option<String>,
}

/// The authenticated principal of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub session_id: Uuid,
    pub user: SessionUser,
    pub expires_at: DateTime<Utc>,
}

/// Looks up the principal behind a request's credentials.
///
/// Implementations never fail: a missing, malformed or expired credential is `None`.
#[async_trait]
pub trait SessionResolver: Send + Sync + 'static {
    async fn resolve(&self, headers: &HeaderMap) -> Option<AuthSession>;
}

/// Resolver for deployments without authentication; every request is anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousResolver;

#[async_trait]
impl SessionResolver for AnonymousResolver {
    async fn resolve(&self, _headers: &HeaderMap) -> Option<AuthSession> {
        None
    }
}
