//! Per-request context, created once per request identity.
//!
//! The factory keeps an arena of live requests: [`ContextFactory::begin`] allocates a
//! slot and returns a [`RequestScope`] guard, every lookup for that request shares the
//! slot's session and context, and dropping the guard frees the slot.

use std::{fmt, ops::Deref, sync::Arc};

use axum::http::HeaderMap;
use dashmap::DashMap;
use db::DBService;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::HandlerError,
    session::{AuthSession, SessionResolver},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// State shared by every procedure call of one request.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub db: DBService,
    pub session: Option<AuthSession>,
    pub user_id: Option<Uuid>,
}

/// A request context that is known to carry a session.
#[derive(Debug, Clone)]
pub struct Authed {
    pub ctx: Arc<RequestContext>,
    pub session: AuthSession,
}

impl Authed {
    pub fn user_id(&self) -> Uuid {
        self.session.user.id
    }
}

impl TryFrom<Arc<RequestContext>> for Authed {
    type Error = HandlerError;

    fn try_from(ctx: Arc<RequestContext>) -> Result<Self, Self::Error> {
        let session = ctx.session.clone().ok_or(HandlerError::Unauthorized)?;
        Ok(Self { ctx, session })
    }
}

impl Deref for Authed {
    type Target = RequestContext;
    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("request {0} is not active")]
    UnknownRequest(RequestId),
}

struct RequestSlot {
    headers: HeaderMap,
    session: OnceCell<Option<AuthSession>>,
    context: OnceCell<Arc<RequestContext>>,
}

#[derive(Clone)]
pub struct ContextFactory {
    db: DBService,
    resolver: Arc<dyn SessionResolver>,
    arena: Arc<DashMap<RequestId, Arc<RequestSlot>>>,
}

impl ContextFactory {
    pub fn new(db: DBService, resolver: Arc<dyn SessionResolver>) -> Self {
        Self {
            db,
            resolver,
            arena: Arc::new(DashMap::new()),
        }
    }

    /// Start tracking a request. The returned guard must live as long as the request.
    pub fn begin(&self, headers: HeaderMap) -> RequestScope {
        let id = RequestId::new();
        let slot = Arc::new(RequestSlot {
            headers,
            session: OnceCell::new(),
            context: OnceCell::new(),
        });
        self.arena.insert(id, slot.clone());
        debug!(request_id = %id, "Request scope opened");
        RequestScope {
            id,
            slot,
            factory: self.clone(),
        }
    }

    /// Context of a live request, looked up by identity.
    pub async fn context(&self, id: RequestId) -> Result<Arc<RequestContext>, ContextError> {
        let slot = self
            .arena
            .get(&id)
            .map(|slot| slot.clone())
            .ok_or(ContextError::UnknownRequest(id))?;
        Ok(self.context_in(id, &slot).await)
    }

    pub fn active_requests(&self) -> usize {
        self.arena.len()
    }

    async fn session_in(&self, slot: &RequestSlot) -> Option<AuthSession> {
        slot.session
            .get_or_init(|| self.resolver.resolve(&slot.headers))
            .await
            .clone()
    }

    async fn context_in(&self, id: RequestId, slot: &RequestSlot) -> Arc<RequestContext> {
        slot.context
            .get_or_init(|| async {
                let session = self.session_in(slot).await;
                Arc::new(RequestContext {
                    request_id: id,
                    db: self.db.clone(),
                    user_id: session.as_ref().map(|s| s.user.id),
                    session,
                })
            })
            .await
            .clone()
    }
}

/// Guard for one live request; dropping it removes the request from the arena.
pub struct RequestScope {
    id: RequestId,
    slot: Arc<RequestSlot>,
    factory: ContextFactory,
}

impl RequestScope {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.slot.headers
    }

    /// The request's principal, resolved at most once.
    pub async fn session(&self) -> Option<AuthSession> {
        self.factory.session_in(&self.slot).await
    }

    pub async fn context(&self) -> Arc<RequestContext> {
        self.factory.context_in(self.id, &self.slot).await
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.factory.arena.remove(&self.id);
        debug!(request_id = %self.id, "Request scope closed");
    }
}
