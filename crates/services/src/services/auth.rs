//! Cookie-backed sessions.
//!
//! The session cookie holds `<token>.<signature>`. Only the token is stored; the
//! signature lets a forged or truncated cookie be rejected without a database read.
//!
//! Email-and-password accounts sign up and sign in here; both end in a fresh session.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use db::{
    DBService,
    models::{
        account::Account,
        session::{CreateSession, Session},
        user::{CreateUser, User},
    },
};
use rand::RngCore;
use rpc::{
    AuthSession, FieldIssue, SessionResolver, SessionUser, Validate,
    api::auth::{SignIn, SignUp},
};
use thiserror::Error;
use tracing::{debug, error, info};
use utils::{
    cookie::{self, CookieSigner},
    password::{self, PasswordError},
};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "postboard.session_token";
pub const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// A session this close to expiry is pushed out by a full TTL on its next use.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("user {0} does not exist")]
    UnknownUser(Uuid),
    #[error("input validation failed")]
    Validation(Vec<FieldIssue>),
    #[error("an account with this email already exists")]
    EmailTaken,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error("password task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct AuthService {
    db: DBService,
    signer: CookieSigner,
    secure_cookies: bool,
}

impl AuthService {
    pub fn new(db: DBService, secret: impl AsRef<[u8]>, secure_cookies: bool) -> Self {
        Self {
            db,
            signer: CookieSigner::new(secret),
            secure_cookies,
        }
    }

    /// Start a session for `user_id`. Returns the row and the signed cookie value.
    pub async fn issue_session(
        &self,
        user_id: Uuid,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(Session, String), AuthError> {
        if User::find_by_id(&self.db.pool, user_id).await?.is_none() {
            return Err(AuthError::UnknownUser(user_id));
        }
        let token = new_token();
        let session = Session::create(
            &self.db.pool,
            &CreateSession {
                user_id,
                token: token.clone(),
                expires_at: Utc::now() + ttl(SESSION_TTL),
                ip_address,
                user_agent,
            },
        )
        .await?;
        info!(user_id = %user_id, session_id = %session.id, "Session issued");
        Ok((session, self.signer.sign(&token)))
    }

    /// Create a user with a password account and sign them in.
    pub async fn sign_up(
        &self,
        input: &SignUp,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(User, String), AuthError> {
        input.validate().map_err(AuthError::Validation)?;
        let email = input.email.trim().to_lowercase();
        if User::find_by_email(&self.db.pool, &email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let plain = input.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || password::hash_password(&plain)).await??;

        let mut tx = self.db.pool.begin().await?;
        let user = User::create(
            &mut *tx,
            &CreateUser {
                name: input.name.trim().to_string(),
                email,
                image: None,
            },
        )
        .await
        .map_err(email_conflict)?;
        Account::create(&mut *tx, user.id, &password_hash).await?;
        tx.commit().await?;
        info!(user_id = %user.id, "User signed up");

        let (_, signed) = self.issue_session(user.id, ip_address, user_agent).await?;
        Ok((user, signed))
    }

    /// Check an email and password and start a session. Unknown emails and wrong
    /// passwords fail alike.
    pub async fn sign_in(
        &self,
        input: &SignIn,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(User, String), AuthError> {
        input.validate().map_err(AuthError::Validation)?;
        let Some(user) = User::find_by_email(&self.db.pool, input.email.trim()).await? else {
            debug!("Sign-in for unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        let Some(account) = Account::find_by_user_id(&self.db.pool, user.id).await? else {
            debug!(user_id = %user.id, "Sign-in for user without a password account");
            return Err(AuthError::InvalidCredentials);
        };

        let plain = input.password.clone();
        let matches = tokio::task::spawn_blocking(move || {
            password::verify_password(&plain, &account.password_hash)
        })
        .await??;
        if !matches {
            debug!(user_id = %user.id, "Sign-in with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let (_, signed) = self.issue_session(user.id, ip_address, user_agent).await?;
        Ok((user, signed))
    }

    /// Delete the session named by the request's cookie. Returns whether one existed.
    pub async fn revoke_session(&self, headers: &HeaderMap) -> Result<bool, AuthError> {
        let Some(token) = self.token(headers) else {
            return Ok(false);
        };
        let removed = Session::delete_by_token(&self.db.pool, token).await?;
        debug!(removed, "Session revoked");
        Ok(removed > 0)
    }

    pub fn session_cookie(&self, signed: &str) -> String {
        cookie::set_cookie_header(SESSION_COOKIE, signed, SESSION_TTL, self.secure_cookies)
    }

    pub fn clear_session_cookie(&self) -> String {
        cookie::clear_cookie_header(SESSION_COOKIE)
    }

    /// The verified token of the request's session cookie, if any.
    fn token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        let signed = cookie::read_cookie(headers, SESSION_COOKIE)?;
        match self.signer.verify(signed) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!(error = %e, "Ignoring session cookie");
                None
            }
        }
    }

    async fn lookup(&self, headers: &HeaderMap) -> Result<Option<AuthSession>, AuthError> {
        let Some(token) = self.token(headers) else {
            return Ok(None);
        };
        let Some(mut session) = Session::find_by_token(&self.db.pool, token).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if session.is_expired(now) {
            Session::delete_by_token(&self.db.pool, token).await?;
            debug!(session_id = %session.id, "Expired session removed");
            return Ok(None);
        }
        if session.expires_at - now < ttl(REFRESH_WINDOW) {
            session.expires_at = now + ttl(SESSION_TTL);
            Session::extend(&self.db.pool, session.id, session.expires_at).await?;
            debug!(session_id = %session.id, expires_at = %session.expires_at, "Session refreshed");
        }

        let Some(user) = User::find_by_id(&self.db.pool, session.user_id).await? else {
            return Ok(None);
        };
        Ok(Some(AuthSession {
            session_id: session.id,
            user: SessionUser {
                id: user.id,
                name: user.name,
                email: user.email,
                image: user.image,
            },
            expires_at: session.expires_at,
        }))
    }
}

#[async_trait]
impl SessionResolver for AuthService {
    async fn resolve(&self, headers: &HeaderMap) -> Option<AuthSession> {
        match self.lookup(headers).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Session lookup failed; treating request as anonymous");
                None
            }
        }
    }
}

/// A concurrent sign-up can win the race past the email check; its unique violation is a conflict.
fn email_conflict(e: sqlx::Error) -> AuthError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => AuthError::EmailTaken,
        _ => AuthError::Database(e),
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn ttl(duration: Duration) -> chrono::Duration {
    chrono::Duration::seconds(duration.as_secs() as i64)
}
