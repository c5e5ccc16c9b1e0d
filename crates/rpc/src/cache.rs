//! Keyed store of query results with in-flight deduplication.
//!
//! Every key has at most one fetch in flight. Concurrent readers of a key await the
//! same shared future, and the loader runs outside the cache lock. A fetch only writes
//! its result back if it is still the entry's current fetch, so an invalidation that
//! lands while a fetch is running always wins. A fetch whose last reader goes away
//! before it settles is dropped, so the next read starts over.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::{error::RpcError, key::QueryKey};

pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleTime {
    /// Fresh until invalidated.
    #[default]
    Never,
    After(Duration),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Replaces the entry's stale time when set.
    pub stale_time: Option<StaleTime>,
}

/// Settled result of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueryState {
    Success {
        data: Value,
        #[serde(rename = "updatedAt")]
        updated_at: DateTime<Utc>,
    },
    Error {
        error: RpcError,
        #[serde(rename = "updatedAt")]
        updated_at: DateTime<Utc>,
    },
}

impl QueryState {
    pub fn from_result(result: &Result<Value, RpcError>) -> Self {
        let updated_at = Utc::now();
        match result {
            Ok(data) => Self::Success {
                data: data.clone(),
                updated_at,
            },
            Err(error) => Self::Error {
                error: error.clone(),
                updated_at,
            },
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Success { updated_at, .. } | Self::Error { updated_at, .. } => *updated_at,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match self {
            Self::Error { error, .. } => Some(error),
            Self::Success { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Error { error, .. } => Err(error),
        }
    }
}

/// Selects entries for [`QueryCache::invalidate`].
#[derive(Clone)]
pub enum QueryFilter {
    All,
    Exact(QueryKey),
    /// Every entry of one procedure, whatever its input.
    Path(String),
    Predicate(Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>),
}

impl QueryFilter {
    pub fn predicate(f: impl Fn(&QueryKey) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => exact == key,
            Self::Path(path) => key.path() == path,
            Self::Predicate(f) => f(key),
        }
    }
}

impl fmt::Debug for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Exact(key) => f.debug_tuple("Exact").field(&key.hash()).finish(),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, RpcError>>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
    /// Readers currently awaiting `fetch`.
    waiters: usize,
}

struct Entry {
    key: QueryKey,
    state: Option<QueryState>,
    fetch: Option<InFlight>,
    invalidated: bool,
    stale_time: StaleTime,
    observers: usize,
    last_used: Instant,
    seq: u64,
}

impl Entry {
    fn new(key: QueryKey, seq: u64) -> Self {
        Self {
            key,
            state: None,
            fetch: None,
            invalidated: false,
            stale_time: StaleTime::default(),
            observers: 0,
            last_used: Instant::now(),
            seq,
        }
    }

    fn fresh_state(&self) -> Option<&QueryState> {
        if self.invalidated {
            return None;
        }
        let state = self.state.as_ref()?;
        match self.stale_time {
            StaleTime::Never => Some(state),
            StaleTime::After(stale_after) => {
                let age = Utc::now().signed_duration_since(state.updated_at());
                // A timestamp from the future counts as fresh.
                match age.to_std() {
                    Ok(age) if age >= stale_after => None,
                    _ => Some(state),
                }
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    next_fetch: u64,
}

impl Inner {
    fn entry_mut(&mut self, key: &QueryKey) -> &mut Entry {
        let seq = &mut self.next_seq;
        self.entries.entry(key.hash().to_string()).or_insert_with(|| {
            *seq += 1;
            Entry::new(key.clone(), *seq)
        })
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
    gc_time: Duration,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("gc_time", &self.gc_time)
            .finish()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_gc_time(DEFAULT_GC_TIME)
    }

    pub fn with_gc_time(gc_time: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            gc_time,
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: &QueryKey, loader: F) -> Result<Value, RpcError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.get_or_fetch_with(key, QueryOptions::default(), loader)
            .await
    }

    /// Fresh cached result, else the in-flight fetch, else a new fetch via `loader`.
    ///
    /// A cached error is fresh like any other result and is returned without calling
    /// the loader again.
    pub async fn get_or_fetch_with<F, Fut>(
        &self,
        key: &QueryKey,
        options: QueryOptions,
        loader: F,
    ) -> Result<Value, RpcError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let (fetch, _waiter) = {
            let mut inner = lock(&self.inner);
            let entry = inner.entry_mut(key);
            entry.last_used = Instant::now();
            if let Some(stale_time) = options.stale_time {
                entry.stale_time = stale_time;
            }
            if let Some(state) = entry.fresh_state() {
                trace!(query = key.hash(), "Query cache hit");
                return state.clone().into_result();
            }
            let joined = entry.fetch.as_mut().map(|in_flight| {
                in_flight.waiters += 1;
                (in_flight.id, in_flight.fetch.clone())
            });
            match joined {
                Some((fetch_id, fetch)) => {
                    trace!(query = key.hash(), fetch_id, "Joining in-flight fetch");
                    (fetch, self.waiter(key, fetch_id))
                }
                None => self.start_fetch(&mut inner, key, loader),
            }
        };
        fetch.await
    }

    /// Start a new fetch even if a fresh result or a pending fetch exists.
    pub async fn refetch<F, Fut>(&self, key: &QueryKey, loader: F) -> Result<Value, RpcError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let (fetch, _waiter) = {
            let mut inner = lock(&self.inner);
            inner.entry_mut(key).last_used = Instant::now();
            self.start_fetch(&mut inner, key, loader)
        };
        fetch.await
    }

    fn start_fetch<F, Fut>(
        &self,
        inner: &mut Inner,
        key: &QueryKey,
        loader: F,
    ) -> (SharedFetch, FetchWaiter)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        inner.next_fetch += 1;
        let fetch_id = inner.next_fetch;
        let cache = Arc::downgrade(&self.inner);
        let hash = key.hash().to_string();
        debug!(query = %hash, fetch_id, "Starting query fetch");

        let fetch = async move {
            let result = loader().await;
            settle(&cache, &hash, fetch_id, &result);
            result
        }
        .boxed()
        .shared();

        inner.entry_mut(key).fetch = Some(InFlight {
            id: fetch_id,
            fetch: fetch.clone(),
            waiters: 1,
        });
        (fetch, self.waiter(key, fetch_id))
    }

    fn waiter(&self, key: &QueryKey, fetch_id: u64) -> FetchWaiter {
        FetchWaiter {
            cache: Arc::downgrade(&self.inner),
            hash: key.hash().to_string(),
            fetch_id,
        }
    }

    pub fn peek(&self, key: &QueryKey) -> Option<QueryState> {
        lock(&self.inner)
            .entries
            .get(key.hash())
            .and_then(|entry| entry.state.clone())
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        lock(&self.inner)
            .entries
            .get(key.hash())
            .is_some_and(|entry| entry.fetch.is_some())
    }

    /// Store `data` as a fresh result, replacing any pending fetch.
    pub fn set(&self, key: &QueryKey, data: Value) {
        let mut inner = lock(&self.inner);
        let entry = inner.entry_mut(key);
        entry.state = Some(QueryState::from_result(&Ok(data)));
        entry.fetch = None;
        entry.invalidated = false;
        entry.last_used = Instant::now();
    }

    /// Mark matching entries stale and drop their pending fetches. Returns how many matched.
    pub fn invalidate(&self, filter: &QueryFilter) -> usize {
        let mut inner = lock(&self.inner);
        let mut count = 0;
        for entry in inner.entries.values_mut() {
            if filter.matches(&entry.key) {
                entry.invalidated = true;
                entry.fetch = None;
                count += 1;
            }
        }
        debug!(?filter, count, "Invalidated queries");
        count
    }

    /// Register interest in `key`; an observed entry is never collected.
    pub fn observe(&self, key: &QueryKey) -> QueryObserver {
        lock(&self.inner).entry_mut(key).observers += 1;
        QueryObserver {
            cache: Arc::downgrade(&self.inner),
            hash: key.hash().to_string(),
        }
    }

    /// Drop unobserved, settled entries idle for at least the gc time.
    pub fn gc(&self) -> usize {
        let mut inner = lock(&self.inner);
        let before = inner.entries.len();
        let gc_time = self.gc_time;
        inner.entries.retain(|_, entry| {
            entry.observers > 0 || entry.fetch.is_some() || entry.last_used.elapsed() < gc_time
        });
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, remaining = inner.entries.len(), "Collected idle queries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create the entry now so creation order follows call order.
    pub(crate) fn reserve(&self, key: &QueryKey) {
        lock(&self.inner).entry_mut(key);
    }

    /// Settled, non-invalidated entries in creation order.
    pub(crate) fn settled(&self) -> Vec<(QueryKey, QueryState)> {
        let inner = lock(&self.inner);
        let mut entries: Vec<_> = inner
            .entries
            .values()
            .filter(|entry| !entry.invalidated)
            .filter_map(|entry| Some((entry.seq, entry.key.clone(), entry.state.clone()?)))
            .collect();
        entries.sort_by_key(|(seq, ..)| *seq);
        entries
            .into_iter()
            .map(|(_, key, state)| (key, state))
            .collect()
    }

    /// Write every entry under one lock; an existing newer result is kept.
    pub(crate) fn restore(&self, entries: Vec<(QueryKey, QueryState)>) -> usize {
        let mut inner = lock(&self.inner);
        let mut restored = 0;
        for (key, state) in entries {
            let entry = inner.entry_mut(&key);
            let newer_exists = entry
                .state
                .as_ref()
                .is_some_and(|current| current.updated_at() >= state.updated_at());
            if newer_exists {
                continue;
            }
            entry.state = Some(state);
            entry.invalidated = false;
            entry.last_used = Instant::now();
            restored += 1;
        }
        restored
    }
}

fn settle(cache: &Weak<Mutex<Inner>>, hash: &str, fetch_id: u64, result: &Result<Value, RpcError>) {
    let Some(cache) = cache.upgrade() else {
        return;
    };
    let mut inner = lock(&cache);
    let Some(entry) = inner.entries.get_mut(hash) else {
        return;
    };
    if entry.fetch.as_ref().is_some_and(|in_flight| in_flight.id == fetch_id) {
        entry.fetch = None;
        entry.state = Some(QueryState::from_result(result));
        entry.invalidated = false;
        entry.last_used = Instant::now();
    } else {
        debug!(query = %hash, fetch_id, "Discarding superseded fetch result");
    }
}

/// One reader awaiting a fetch. When the last reader of an unsettled fetch is
/// dropped the fetch is abandoned and removed from its entry.
struct FetchWaiter {
    cache: Weak<Mutex<Inner>>,
    hash: String,
    fetch_id: u64,
}

impl Drop for FetchWaiter {
    fn drop(&mut self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let mut inner = lock(&cache);
        let Some(entry) = inner.entries.get_mut(&self.hash) else {
            return;
        };
        let Some(in_flight) = entry
            .fetch
            .as_mut()
            .filter(|in_flight| in_flight.id == self.fetch_id)
        else {
            return;
        };
        in_flight.waiters -= 1;
        if in_flight.waiters > 0 {
            return;
        }
        entry.last_used = Instant::now();
        let abandoned = entry.fetch.take();
        drop(inner);
        drop(abandoned);
        debug!(query = %self.hash, fetch_id = self.fetch_id, "Abandoned fetch with no readers");
    }
}

/// Interest in one cache entry, released on drop.
pub struct QueryObserver {
    cache: Weak<Mutex<Inner>>,
    hash: String,
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryObserver").field(&self.hash).finish()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let mut inner = lock(&cache);
        if let Some(entry) = inner.entries.get_mut(&self.hash) {
            entry.observers = entry.observers.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::HandlerCode;

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: Value,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, RpcError>> + Send + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    fn list_key() -> QueryKey {
        QueryKey::new("post.list", json!({ "limit": 10 }))
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_fetch() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = list_key();

        let (a, b) = tokio::join!(
            cache.get_or_fetch(&key, counting_loader(&calls, json!([1]))),
            cache.get_or_fetch(&key, counting_loader(&calls, json!([2])))
        );
        assert_eq!(a.unwrap(), json!([1]));
        assert_eq!(b.unwrap(), json!([1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Settled and fresh: no further loads.
        let c = cache
            .get_or_fetch(&key, counting_loader(&calls, json!([3])))
            .await;
        assert_eq!(c.unwrap(), json!([1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_forces_a_reload() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = list_key();
        let by_id = QueryKey::new("post.byId", json!({ "id": "a" }));

        cache.get_or_fetch(&key, counting_loader(&calls, json!(1))).await.unwrap();
        cache.get_or_fetch(&by_id, counting_loader(&calls, json!(2))).await.unwrap();
        assert_eq!(cache.invalidate(&QueryFilter::Path("post.list".into())), 1);

        let reloaded = cache
            .get_or_fetch(&key, counting_loader(&calls, json!(3)))
            .await
            .unwrap();
        assert_eq!(reloaded, json!(3));
        let untouched = cache
            .get_or_fetch(&by_id, counting_loader(&calls, json!(4)))
            .await
            .unwrap();
        assert_eq!(untouched, json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidation_during_fetch_discards_its_result() {
        let cache = QueryCache::new();
        let key = list_key();
        let (release, wait) = oneshot::channel::<()>();

        let pending = tokio::spawn({
            let cache = cache.clone();
            let key = key.clone();
            async move {
                cache
                    .get_or_fetch(&key, move || async move {
                        let _ = wait.await;
                        Ok(json!("stale"))
                    })
                    .await
            }
        });
        while !cache.is_fetching(&key) {
            tokio::task::yield_now().await;
        }

        cache.invalidate(&QueryFilter::Exact(key.clone()));
        release.send(()).unwrap();
        // The waiter still gets its answer; the cache does not keep it.
        assert_eq!(pending.await.unwrap().unwrap(), json!("stale"));
        assert!(cache.peek(&key).is_none());

        let fresh = cache
            .get_or_fetch(&key, || async { Ok(json!("fresh")) })
            .await
            .unwrap();
        assert_eq!(fresh, json!("fresh"));
    }

    #[tokio::test]
    async fn abandoned_fetch_is_dropped_and_collected() {
        let cache = QueryCache::with_gc_time(Duration::ZERO);
        let key = list_key();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch(&key, || futures::future::pending()),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!cache.is_fetching(&key));

        assert_eq!(cache.gc(), 1);
        assert!(cache.is_empty());

        // The next read starts a fresh fetch instead of joining the abandoned one.
        let value = cache
            .get_or_fetch(&key, || async { Ok(json!("loaded")) })
            .await
            .unwrap();
        assert_eq!(value, json!("loaded"));
    }

    #[tokio::test]
    async fn fetch_survives_while_another_reader_waits() {
        let cache = QueryCache::new();
        let key = list_key();
        let (release, wait) = oneshot::channel::<()>();

        let patient = tokio::spawn({
            let cache = cache.clone();
            let key = key.clone();
            async move {
                cache
                    .get_or_fetch(&key, move || async move {
                        let _ = wait.await;
                        Ok(json!("done"))
                    })
                    .await
            }
        });
        while !cache.is_fetching(&key) {
            tokio::task::yield_now().await;
        }

        let impatient = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch(&key, || async { Ok(json!("unused")) }),
        )
        .await;
        assert!(impatient.is_err());
        assert!(cache.is_fetching(&key));

        release.send(()).unwrap();
        assert_eq!(patient.await.unwrap().unwrap(), json!("done"));
        assert!(matches!(cache.peek(&key), Some(QueryState::Success { .. })));
    }

    #[tokio::test]
    async fn cached_errors_are_not_retried() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::new("post.byId", json!({ "id": "missing" }));
        let not_found = RpcError::Handler {
            code: HandlerCode::NotFound,
            message: "post not found".into(),
        };

        for _ in 0..2 {
            let calls = calls.clone();
            let error = not_found.clone();
            let result = cache
                .get_or_fetch(&key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(error)
                })
                .await;
            assert_eq!(result.unwrap_err(), not_found);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let retried = cache
            .refetch(&key, || async { Ok(json!({ "id": "missing" })) })
            .await;
        assert!(retried.is_ok());
        assert!(matches!(cache.peek(&key), Some(QueryState::Success { .. })));
    }

    #[tokio::test]
    async fn stale_time_expires_results() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = list_key();
        let options = QueryOptions {
            stale_time: Some(StaleTime::After(Duration::from_millis(30))),
        };

        cache
            .get_or_fetch_with(&key, options, counting_loader(&calls, json!(1)))
            .await
            .unwrap();
        cache
            .get_or_fetch(&key, counting_loader(&calls, json!(2)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let value = cache
            .get_or_fetch(&key, counting_loader(&calls, json!(3)))
            .await
            .unwrap();
        assert_eq!(value, json!(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gc_keeps_observed_entries() {
        let cache = QueryCache::with_gc_time(Duration::ZERO);
        let key = list_key();
        let other = QueryKey::new("post.byId", json!({ "id": "b" }));
        cache.set(&key, json!(1));
        cache.set(&other, json!(2));

        let observer = cache.observe(&key);
        assert_eq!(cache.gc(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(&other).is_none());

        drop(observer);
        assert_eq!(cache.gc(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn state_wire_shape() {
        let state = QueryState::Success {
            data: json!({ "posts": [] }),
            updated_at: "2025-01-01T00:00:00Z".parse().unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "status": "success",
                "data": { "posts": [] },
                "updatedAt": "2025-01-01T00:00:00Z",
            })
        );
    }
}
