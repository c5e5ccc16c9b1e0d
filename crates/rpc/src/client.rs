//! HTTP client for the procedure endpoint, backed by a [`QueryCache`].

use std::{fmt, marker::PhantomData, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use reqwest::{Client, header};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;
use url::Url;
use utils::response::ApiResponse;

use crate::{
    cache::{QueryCache, QueryFilter, QueryObserver, QueryState},
    error::{FieldIssue, HandlerError, RpcError},
    hydration::{self, DehydratedState},
    key::QueryKey,
    procedure::{MutationDescriptor, QueryDescriptor},
    registry::CallOutcome,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct Transport {
    http: Client,
    base_url: String,
    cookie: Option<String>,
}

impl Transport {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/trpc/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn get(&self, key: &QueryKey) -> Result<Value, RpcError> {
        let url = Url::parse_with_params(
            &self.endpoint(key.path()),
            &[("input", key.input().to_string())],
        )
        .map_err(|e| RpcError::network(e.to_string()))?;
        let request = self.with_cookie(self.http.get(url));
        Ok(Self::send(request).await?.result)
    }

    async fn post(&self, path: &str, input: Value) -> Result<CallOutcome, RpcError> {
        let request = self.with_cookie(self.http.post(self.endpoint(path)).json(&input));
        Self::send(request).await
    }

    fn with_cookie(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.cookie {
            Some(cookie) => request.header(header::COOKIE, cookie),
            None => request,
        }
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<CallOutcome, RpcError> {
        let res = request
            .send()
            .await
            .map_err(|e| RpcError::network(e.to_string()))?;
        let status = res.status();
        let body: ApiResponse<CallOutcome, RpcError> = res
            .json()
            .await
            .map_err(|e| RpcError::network(format!("unreadable {status} response: {e}")))?;

        if body.is_success() {
            return body
                .into_data()
                .ok_or_else(|| RpcError::network("success response without data"));
        }
        let message = body.message().unwrap_or("request failed").to_string();
        Err(body
            .into_error_data()
            .unwrap_or_else(|| RpcError::network(format!("{status}: {message}"))))
    }
}

/// Typed procedure calls over HTTP. Queries go through the client's cache; mutations
/// invalidate whatever paths the server reports.
#[derive(Clone)]
pub struct RpcClient {
    transport: Transport,
    cache: QueryCache,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("base_url", &self.transport.base_url)
            .field("cache", &self.cache)
            .finish()
    }
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RpcError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("postboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RpcError::network(e.to_string()))?;
        Ok(Self {
            transport: Transport {
                http,
                base_url: base_url.into(),
                cookie: None,
            },
            cache: QueryCache::new(),
        })
    }

    /// Send `cookie` as the `Cookie` header of every request.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.transport.cookie = Some(cookie.into());
        self
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Seed the cache from a server-rendered snapshot.
    pub fn hydrate(&self, state: DehydratedState) -> usize {
        hydration::hydrate(&self.cache, state)
    }

    pub async fn query<I, O>(&self, descriptor: QueryDescriptor<I, O>, input: &I) -> Result<O, RpcError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let key = key_for(descriptor, input)?;
        let value = self.cache.get_or_fetch(&key, self.loader(&key)).await?;
        decode(descriptor.path(), value)
    }

    pub async fn mutate<I, O>(
        &self,
        descriptor: MutationDescriptor<I, O>,
        input: &I,
    ) -> Result<O, RpcError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)
            .map_err(|e| RpcError::validation(vec![FieldIssue::new("", e.to_string())]))?;
        let outcome = self.transport.post(descriptor.path(), input).await?;
        for path in &outcome.invalidates {
            self.cache.invalidate(&QueryFilter::Path(path.clone()));
        }
        debug!(path = descriptor.path(), invalidated = ?outcome.invalidates, "Mutation applied");
        decode(descriptor.path(), outcome.result)
    }

    /// Observe a query. The entry stays in the cache while the handle lives.
    pub fn use_query<I, O>(
        &self,
        descriptor: QueryDescriptor<I, O>,
        input: &I,
    ) -> Result<QueryHandle<O>, RpcError>
    where
        I: Serialize,
    {
        let key = key_for(descriptor, input)?;
        Ok(QueryHandle {
            observer: self.cache.observe(&key),
            client: self.clone(),
            key,
            _output: PhantomData,
        })
    }

    fn loader(
        &self,
        key: &QueryKey,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, RpcError>> + Send + 'static {
        let transport = self.transport.clone();
        let key = key.clone();
        move || async move { transport.get(&key).await }.boxed()
    }
}

fn key_for<I: Serialize, O>(
    descriptor: QueryDescriptor<I, O>,
    input: &I,
) -> Result<QueryKey, RpcError> {
    descriptor
        .key(input)
        .map_err(|e| RpcError::validation(vec![FieldIssue::new("", e.to_string())]))
}

fn decode<O: DeserializeOwned>(path: &str, value: Value) -> Result<O, RpcError> {
    serde_json::from_value(value).map_err(|e| HandlerError::Internal(e.into()).into_rpc(path))
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus<O> {
    Loading,
    Success(O),
    Error(RpcError),
}

/// A live subscription to one query of an [`RpcClient`].
pub struct QueryHandle<O> {
    client: RpcClient,
    key: QueryKey,
    observer: QueryObserver,
    _output: PhantomData<fn() -> O>,
}

impl<O> fmt::Debug for QueryHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.key.hash())
            .field("observer", &self.observer)
            .finish()
    }
}

impl<O: DeserializeOwned> QueryHandle<O> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current cached state, without fetching.
    pub fn status(&self) -> QueryStatus<O> {
        match self.client.cache.peek(&self.key) {
            None => QueryStatus::Loading,
            Some(QueryState::Error { error, .. }) => QueryStatus::Error(error),
            Some(QueryState::Success { data, .. }) => match decode(self.key.path(), data) {
                Ok(data) => QueryStatus::Success(data),
                Err(e) => QueryStatus::Error(e),
            },
        }
    }

    pub async fn fetch(&self) -> Result<O, RpcError> {
        let value = self
            .client
            .cache
            .get_or_fetch(&self.key, self.client.loader(&self.key))
            .await?;
        decode(self.key.path(), value)
    }

    pub async fn refetch(&self) -> Result<O, RpcError> {
        let value = self
            .client
            .cache
            .refetch(&self.key, self.client.loader(&self.key))
            .await?;
        decode(self.key.path(), value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hydration::DehydratedQuery;

    // Nothing listens on the discard port.
    const DEAD_URL: &str = "http://127.0.0.1:9";

    const LIST: QueryDescriptor<Value, Vec<String>> = QueryDescriptor::new("post.list");

    #[tokio::test]
    async fn transport_failures_are_network_errors() {
        let client = RpcClient::new(DEAD_URL).unwrap();
        let err = client.query(LIST, &json!({ "limit": 10 })).await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
        // Failed loads are cached like any other result.
        let key = LIST.key(&json!({ "limit": 10 })).unwrap();
        assert!(matches!(client.cache().peek(&key), Some(QueryState::Error { .. })));
    }

    #[tokio::test]
    async fn hydrated_queries_resolve_without_the_network() {
        let client = RpcClient::new(DEAD_URL).unwrap();
        let key = LIST.key(&json!({ "limit": 10 })).unwrap();
        client.hydrate(DehydratedState {
            queries: vec![DehydratedQuery {
                query_hash: key.hash().to_string(),
                query_key: key,
                state: QueryState::Success {
                    data: json!(["first"]),
                    updated_at: chrono::Utc::now(),
                },
            }],
        });

        let handle = client.use_query(LIST, &json!({ "limit": 10 })).unwrap();
        assert_eq!(handle.status(), QueryStatus::Success(vec!["first".to_string()]));
        assert_eq!(handle.fetch().await.unwrap(), ["first"]);
    }

    #[tokio::test]
    async fn unseen_queries_start_loading() {
        let client = RpcClient::new(DEAD_URL).unwrap();
        let handle = client.use_query(LIST, &json!({ "limit": 5 })).unwrap();
        assert_eq!(handle.status(), QueryStatus::Loading);
        assert_eq!(client.cache().gc(), 0);
    }
}
