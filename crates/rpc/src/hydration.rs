//! Carries a server-populated query cache across the render boundary.
//!
//! The server runs a page's queries through a [`ServerPrefetcher`], snapshots the
//! settled results with [`dehydrate`] and embeds them in the page. The client reads
//! them back with [`parse_state_script`] and [`hydrate`]s its own cache, so the first
//! read of a prefetched query never hits the network.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    cache::{QueryCache, QueryState},
    context::RequestContext,
    key::QueryKey,
    procedure::{ProcedureKind, QueryDescriptor},
    registry::Registry,
};

pub const STATE_SCRIPT_ID: &str = "__POSTBOARD_STATE__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
    pub query_key: QueryKey,
    pub query_hash: String,
    pub state: QueryState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    pub queries: Vec<DehydratedQuery>,
}

#[derive(Debug, Error)]
pub enum HydrationError {
    #[error("no state script in document")]
    MissingScript,
    #[error("state script is not terminated")]
    Unterminated,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Snapshot of every settled entry, success and error alike, in creation order.
pub fn dehydrate(cache: &QueryCache) -> DehydratedState {
    let queries = cache
        .settled()
        .into_iter()
        .map(|(key, state)| DehydratedQuery {
            query_hash: key.hash().to_string(),
            query_key: key,
            state,
        })
        .collect();
    DehydratedState { queries }
}

/// Load a snapshot into `cache` in one step. Entries the cache already holds a newer
/// result for are skipped. Returns how many entries were written.
pub fn hydrate(cache: &QueryCache, state: DehydratedState) -> usize {
    let total = state.queries.len();
    let restored = cache.restore(
        state
            .queries
            .into_iter()
            .map(|query| (query.query_key, query.state))
            .collect(),
    );
    debug!(total, restored, "Hydrated query cache");
    restored
}

fn script_open() -> String {
    format!(r#"<script id="{STATE_SCRIPT_ID}" type="application/json">"#)
}

/// `<script>` element holding the snapshot, safe to inline in HTML.
pub fn render_state_script(state: &DehydratedState) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(state)?
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026");
    Ok(format!("{}{json}</script>", script_open()))
}

pub fn parse_state_script(html: &str) -> Result<DehydratedState, HydrationError> {
    let open = script_open();
    let start = html.find(&open).ok_or(HydrationError::MissingScript)? + open.len();
    let len = html[start..]
        .find("</script>")
        .ok_or(HydrationError::Unterminated)?;
    Ok(serde_json::from_str(&html[start..start + len])?)
}

/// Runs a page's queries on the server ahead of rendering.
///
/// Each prefetch is spawned immediately and shares the request's context; a failing
/// prefetch is recorded as an error entry and never affects its siblings.
pub struct ServerPrefetcher {
    registry: Arc<Registry>,
    ctx: Arc<RequestContext>,
    cache: QueryCache,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerPrefetcher {
    pub fn new(registry: Arc<Registry>, ctx: Arc<RequestContext>) -> Self {
        Self {
            registry,
            ctx,
            cache: QueryCache::new(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn prefetch<I, O>(&self, descriptor: QueryDescriptor<I, O>, input: &I)
    where
        I: Serialize,
    {
        match descriptor.key(input) {
            Ok(key) => self.spawn(key),
            Err(e) => warn!(path = descriptor.path(), error = %e, "Could not encode prefetch input"),
        }
    }

    pub fn prefetch_raw(&self, path: &str, input: Value) {
        self.spawn(QueryKey::new(path, input));
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    fn spawn(&self, key: QueryKey) {
        self.cache.reserve(&key);
        let registry = self.registry.clone();
        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let handle = tokio::spawn(async move {
            let call_key = key.clone();
            let result = cache
                .get_or_fetch(&key, move || async move {
                    registry
                        .call_kind(
                            ctx,
                            ProcedureKind::Query,
                            call_key.path(),
                            call_key.input().clone(),
                        )
                        .await
                        .map(|outcome| outcome.result)
                })
                .await;
            if let Err(e) = result {
                debug!(query = key.hash(), code = e.code(), "Prefetch settled with an error");
            }
        });
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Wait for every prefetch to settle, then snapshot the cache.
    pub async fn dehydrate(self) -> DehydratedState {
        let pending = self
            .pending
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        for joined in futures::future::join_all(pending).await {
            if let Err(e) = joined {
                warn!(error = %e, "Prefetch task did not complete");
            }
        }
        dehydrate(&self.cache)
    }
}
