use std::{fmt, future::Future, marker::PhantomData, sync::Arc};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use ts_rs::TS;

use crate::{
    context::{Authed, RequestContext},
    error::{FieldIssue, HandlerError, RpcError},
    key::QueryKey,
    validate::Validate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum AuthTier {
    /// Callable without a session
    Public,
    /// Rejected with `Unauthorized` before validation when no session is present
    Principal,
}

/// Typed name of a query, shared by server registration and client calls.
pub struct QueryDescriptor<I, O> {
    path: &'static str,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> QueryDescriptor<I, O> {
    pub const fn new(path: &'static str) -> Self {
        Self {
            path,
            _types: PhantomData,
        }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn key(&self, input: &I) -> Result<QueryKey, serde_json::Error>
    where
        I: Serialize,
    {
        QueryKey::from_input(self.path, input)
    }
}

impl<I, O> Clone for QueryDescriptor<I, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, O> Copy for QueryDescriptor<I, O> {}

impl<I, O> fmt::Debug for QueryDescriptor<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryDescriptor").field(&self.path).finish()
    }
}

/// Typed name of a mutation plus the query paths its success makes stale.
pub struct MutationDescriptor<I, O> {
    path: &'static str,
    invalidates: &'static [&'static str],
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> MutationDescriptor<I, O> {
    pub const fn new(path: &'static str, invalidates: &'static [&'static str]) -> Self {
        Self {
            path,
            invalidates,
            _types: PhantomData,
        }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn invalidates(&self) -> &'static [&'static str] {
        self.invalidates
    }
}

impl<I, O> Clone for MutationDescriptor<I, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, O> Copy for MutationDescriptor<I, O> {}

impl<I, O> fmt::Debug for MutationDescriptor<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDescriptor")
            .field("path", &self.path)
            .field("invalidates", &self.invalidates)
            .finish()
    }
}

type ErasedHandler =
    Arc<dyn Fn(Arc<RequestContext>, Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// A registered operation with its input decoding and validation erased to JSON.
#[derive(Clone)]
pub struct Procedure {
    pub path: &'static str,
    pub kind: ProcedureKind,
    pub tier: AuthTier,
    pub invalidates: &'static [&'static str],
    handler: ErasedHandler,
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("tier", &self.tier)
            .field("invalidates", &self.invalidates)
            .finish()
    }
}

impl Procedure {
    pub fn query<I, O, F, Fut>(descriptor: QueryDescriptor<I, O>, handler: F) -> Self
    where
        I: DeserializeOwned + Validate + Send + 'static,
        O: Serialize + 'static,
        F: Fn(Arc<RequestContext>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        Self::build(descriptor.path, ProcedureKind::Query, AuthTier::Public, &[], handler)
    }

    pub fn protected_query<I, O, F, Fut>(descriptor: QueryDescriptor<I, O>, handler: F) -> Self
    where
        I: DeserializeOwned + Validate + Send + 'static,
        O: Serialize + 'static,
        F: Fn(Authed, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        Self::build(
            descriptor.path,
            ProcedureKind::Query,
            AuthTier::Principal,
            &[],
            authed(handler),
        )
    }

    pub fn mutation<I, O, F, Fut>(descriptor: MutationDescriptor<I, O>, handler: F) -> Self
    where
        I: DeserializeOwned + Validate + Send + 'static,
        O: Serialize + 'static,
        F: Fn(Arc<RequestContext>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        Self::build(
            descriptor.path,
            ProcedureKind::Mutation,
            AuthTier::Public,
            descriptor.invalidates,
            handler,
        )
    }

    pub fn protected_mutation<I, O, F, Fut>(
        descriptor: MutationDescriptor<I, O>,
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + Validate + Send + 'static,
        O: Serialize + 'static,
        F: Fn(Authed, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        Self::build(
            descriptor.path,
            ProcedureKind::Mutation,
            AuthTier::Principal,
            descriptor.invalidates,
            authed(handler),
        )
    }

    fn build<I, O, F, Fut>(
        path: &'static str,
        kind: ProcedureKind,
        tier: AuthTier,
        invalidates: &'static [&'static str],
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + Validate + Send + 'static,
        O: Serialize + 'static,
        F: Fn(Arc<RequestContext>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |ctx, raw| {
            let handler = handler.clone();
            Box::pin(async move {
                let input: I = decode_input(raw)?;
                input.validate().map_err(RpcError::validation)?;
                let output = handler(ctx, input).await.map_err(|e| e.into_rpc(path))?;
                serde_json::to_value(output)
                    .map_err(|e| HandlerError::Internal(e.into()).into_rpc(path))
            })
        });
        Self {
            path,
            kind,
            tier,
            invalidates,
            handler: erased,
        }
    }

    /// Decode, validate and run. Authorization is the registry's job and happens first.
    pub(crate) async fn invoke(
        &self,
        ctx: Arc<RequestContext>,
        input: Value,
    ) -> Result<Value, RpcError> {
        (self.handler)(ctx, input).await
    }
}

fn authed<I, O, F, Fut>(
    handler: F,
) -> impl Fn(Arc<RequestContext>, I) -> BoxFuture<'static, Result<O, HandlerError>> + Send + Sync + 'static
where
    I: Send + 'static,
    O: 'static,
    F: Fn(Authed, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    move |ctx, input| {
        let handler = handler.clone();
        Box::pin(async move {
            let authed = Authed::try_from(ctx)?;
            handler(authed, input).await
        })
    }
}

/// An absent input (`null`) is read as `{}` so all-default inputs can be omitted.
fn decode_input<I: DeserializeOwned>(raw: Value) -> Result<I, RpcError> {
    let is_null = raw.is_null();
    match serde_json::from_value(raw) {
        Ok(input) => Ok(input),
        Err(_) if is_null => serde_json::from_value(Value::Object(Default::default()))
            .map_err(|e| RpcError::validation(vec![FieldIssue::new("", e.to_string())])),
        Err(e) => Err(RpcError::validation(vec![FieldIssue::new("", e.to_string())])),
    }
}
