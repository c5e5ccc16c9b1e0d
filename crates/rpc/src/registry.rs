use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use ts_rs::TS;

use crate::{
    context::RequestContext,
    error::{FieldIssue, HandlerError, RpcError},
    procedure::{AuthTier, MutationDescriptor, Procedure, ProcedureKind, QueryDescriptor},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("procedure {0} is registered twice")]
    DuplicatePath(&'static str),
    #[error("procedure path {0:?} is not of the form namespace.name")]
    InvalidPath(&'static str),
}

/// Result of a successful call plus the query paths the caller should invalidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct CallOutcome {
    pub result: Value,
    pub invalidates: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    procedures: Vec<Procedure>,
}

impl RegistryBuilder {
    /// Add one namespace's procedures.
    pub fn merge(mut self, procedures: impl IntoIterator<Item = Procedure>) -> Self {
        self.procedures.extend(procedures);
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut procedures = BTreeMap::new();
        for procedure in self.procedures {
            if !is_valid_path(procedure.path) {
                return Err(RegistryError::InvalidPath(procedure.path));
            }
            let path = procedure.path;
            if procedures.insert(path, procedure).is_some() {
                return Err(RegistryError::DuplicatePath(path));
            }
        }
        info!(procedures = procedures.len(), "Procedure registry built");
        Ok(Registry { procedures })
    }
}

fn is_valid_path(path: &str) -> bool {
    let Some((namespace, name)) = path.split_once('.') else {
        return false;
    };
    [namespace, name].iter().all(|segment| {
        segment.starts_with(|c: char| c.is_ascii_alphabetic())
            && segment.chars().all(|c| c.is_ascii_alphanumeric())
    })
}

/// Every procedure the application exposes, keyed by path.
#[derive(Debug)]
pub struct Registry {
    procedures: BTreeMap<&'static str, Procedure>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, path: &str) -> Option<&Procedure> {
        self.procedures.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.procedures.keys().copied()
    }

    /// Authorize, validate and run the procedure at `path`.
    pub async fn call(
        &self,
        ctx: Arc<RequestContext>,
        path: &str,
        input: Value,
    ) -> Result<CallOutcome, RpcError> {
        let procedure = self.lookup(path)?;
        self.run(procedure, ctx, || Ok(input)).await
    }

    /// Like [`Registry::call`], but rejects a procedure of the wrong kind.
    pub async fn call_kind(
        &self,
        ctx: Arc<RequestContext>,
        kind: ProcedureKind,
        path: &str,
        input: Value,
    ) -> Result<CallOutcome, RpcError> {
        let procedure = self.lookup_kind(kind, path)?;
        self.run(procedure, ctx, || Ok(input)).await
    }

    /// Call with the input still as the request's raw JSON. The bytes are only parsed
    /// once the procedure is found and the caller is authorized; blank input is `null`.
    pub async fn call_raw(
        &self,
        ctx: Arc<RequestContext>,
        kind: ProcedureKind,
        path: &str,
        raw: &[u8],
    ) -> Result<CallOutcome, RpcError> {
        let procedure = self.lookup_kind(kind, path)?;
        self.run(procedure, ctx, || parse_raw(raw)).await
    }

    pub async fn query<I, O>(
        &self,
        ctx: Arc<RequestContext>,
        descriptor: QueryDescriptor<I, O>,
        input: &I,
    ) -> Result<O, RpcError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let outcome = self
            .call_kind(ctx, ProcedureKind::Query, descriptor.path(), encode(input)?)
            .await?;
        decode(descriptor.path(), outcome.result)
    }

    pub async fn mutate<I, O>(
        &self,
        ctx: Arc<RequestContext>,
        descriptor: MutationDescriptor<I, O>,
        input: &I,
    ) -> Result<(O, Vec<String>), RpcError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let outcome = self
            .call_kind(ctx, ProcedureKind::Mutation, descriptor.path(), encode(input)?)
            .await?;
        Ok((decode(descriptor.path(), outcome.result)?, outcome.invalidates))
    }

    fn lookup(&self, path: &str) -> Result<&Procedure, RpcError> {
        self.procedures
            .get(path)
            .ok_or_else(|| RpcError::UnknownProcedure {
                path: path.to_string(),
            })
    }

    fn lookup_kind(&self, kind: ProcedureKind, path: &str) -> Result<&Procedure, RpcError> {
        let procedure = self.lookup(path)?;
        if procedure.kind != kind {
            return Err(RpcError::MethodNotSupported {
                path: path.to_string(),
            });
        }
        Ok(procedure)
    }

    async fn run(
        &self,
        procedure: &Procedure,
        ctx: Arc<RequestContext>,
        input: impl FnOnce() -> Result<Value, RpcError>,
    ) -> Result<CallOutcome, RpcError> {
        let path = procedure.path;
        if procedure.tier == AuthTier::Principal && ctx.session.is_none() {
            debug!(%path, request_id = %ctx.request_id, "Rejected anonymous call");
            return Err(RpcError::Unauthorized);
        }

        let request_id = ctx.request_id;
        let input = input().inspect_err(|e| {
            debug!(%path, %request_id, code = e.code(), "Malformed procedure input");
        })?;
        match procedure.invoke(ctx, input).await {
            Ok(result) => {
                debug!(%path, %request_id, "Procedure succeeded");
                Ok(CallOutcome {
                    result,
                    invalidates: procedure.invalidates.iter().map(|p| p.to_string()).collect(),
                })
            }
            Err(e) => {
                warn!(%path, %request_id, code = e.code(), "Procedure failed");
                Err(e)
            }
        }
    }
}

fn parse_raw(raw: &[u8]) -> Result<Value, RpcError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(raw)
        .map_err(|e| RpcError::validation(vec![FieldIssue::new("", format!("malformed input: {e}"))]))
}

fn encode<I: Serialize>(input: &I) -> Result<Value, RpcError> {
    serde_json::to_value(input)
        .map_err(|e| RpcError::validation(vec![FieldIssue::new("", e.to_string())]))
}

fn decode<O: DeserializeOwned>(path: &str, value: Value) -> Result<O, RpcError> {
    serde_json::from_value(value).map_err(|e| HandlerError::Internal(e.into()).into_rpc(path))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use db::DBService;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{
        context::{Authed, RequestId},
        error::HandlerCode,
        session::{AuthSession, SessionUser},
        validate::{Issues, Validate},
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct Note {
        title: String,
    }

    impl Validate for Note {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            issues.length("title", &self.title, 1, Some(20));
            issues.finish()
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Page {
        #[serde(default = "ten")]
        limit: i64,
    }

    fn ten() -> i64 {
        10
    }

    impl Validate for Page {
        fn validate(&self) -> Result<(), Vec<FieldIssue>> {
            let mut issues = Issues::new();
            issues.range("limit", self.limit, 1, 100);
            issues.finish()
        }
    }

    const LIST: QueryDescriptor<Page, Vec<String>> = QueryDescriptor::new("note.list");
    const CREATE: MutationDescriptor<Note, String> =
        MutationDescriptor::new("note.create", &["note.list"]);

    fn registry(calls: Arc<AtomicUsize>) -> Registry {
        let create_calls = calls.clone();
        Registry::builder()
            .merge([
                Procedure::query(LIST, |_ctx, page: Page| async move {
                    Ok::<_, HandlerError>(vec![format!("limit={}", page.limit)])
                }),
                Procedure::protected_mutation(CREATE, move |authed: Authed, note: Note| {
                    let calls = create_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, HandlerError>(format!("{}:{}", authed.user_id(), note.title))
                    }
                }),
            ])
            .build()
            .unwrap()
    }

    async fn context(signed_in: bool) -> Arc<RequestContext> {
        let session = signed_in.then(|| AuthSession {
            session_id: Uuid::new_v4(),
            user: SessionUser {
                id: Uuid::new_v4(),
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                image: None,
            },
            expires_at: Utc::now(),
        });
        Arc::new(RequestContext {
            request_id: RequestId::new(),
            db: DBService::new_in_memory().await.unwrap(),
            user_id: session.as_ref().map(|s| s.user.id),
            session,
        })
    }

    #[tokio::test]
    async fn anonymous_call_to_protected_procedure_never_runs_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry(calls.clone());

        // Invalid input too: authorization is checked before validation.
        let err = registry
            .call(context(false).await, "note.create", json!({ "title": "" }))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Unauthorized);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_input_fails_validation_without_running_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry(calls.clone());

        let err = registry
            .call(context(true).await, "note.create", json!({ "title": "" }))
            .await
            .unwrap_err();
        let RpcError::Validation { issues } = err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert_eq!(issues[0].path, "title");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let err = registry
            .call(context(true).await, "note.create", json!({ "body": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mutation_reports_invalidated_paths() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry(calls.clone());
        let ctx = context(true).await;
        let user_id = ctx.user_id.unwrap();

        let (created, invalidates) = registry
            .mutate(ctx, CREATE, &Note { title: "hello".into() })
            .await
            .unwrap();
        assert_eq!(created, format!("{user_id}:hello"));
        assert_eq!(invalidates, ["note.list"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_input_uses_defaults() {
        let registry = registry(Arc::default());
        let outcome = registry
            .call(context(false).await, "note.list", Value::Null)
            .await
            .unwrap();
        assert_eq!(outcome.result, json!(["limit=10"]));
        assert!(outcome.invalidates.is_empty());
    }

    #[tokio::test]
    async fn unknown_path_and_wrong_kind_are_rejected() {
        let registry = registry(Arc::default());
        let err = registry
            .call(context(false).await, "note.missing", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let err = registry
            .call_kind(context(true).await, ProcedureKind::Query, "note.create", json!({ "title": "x" }))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::MethodNotSupported {
                path: "note.create".to_string()
            }
        );
    }

    #[tokio::test]
    async fn handler_errors_reach_the_caller_as_safe_messages() {
        const BROKEN: QueryDescriptor<(), ()> = QueryDescriptor::new("note.broken");
        let registry = Registry::builder()
            .merge([Procedure::query(BROKEN, |_ctx, ()| async {
                Err::<(), _>(HandlerError::NotFound("note"))
            })])
            .build()
            .unwrap();
        let err = registry.query(context(false).await, BROKEN, &()).await.unwrap_err();
        assert_eq!(
            err,
            RpcError::Handler {
                code: HandlerCode::NotFound,
                message: "note not found".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn raw_input_is_parsed_only_after_lookup_and_authorization() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry(calls.clone());

        let err = registry
            .call_raw(context(false).await, ProcedureKind::Mutation, "note.create", b"{oops")
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Unauthorized);

        let err = registry
            .call_raw(context(false).await, ProcedureKind::Query, "note.missing", b"{oops")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownProcedure { .. }));

        let err = registry
            .call_raw(context(false).await, ProcedureKind::Query, "note.create", b"{oops")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MethodNotSupported { .. }));

        let err = registry
            .call_raw(context(true).await, ProcedureKind::Mutation, "note.create", b"{oops")
            .await
            .unwrap_err();
        let RpcError::Validation { issues } = err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert!(issues[0].message.starts_with("malformed input"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let outcome = registry
            .call_raw(context(false).await, ProcedureKind::Query, "note.list", b"  \n")
            .await
            .unwrap();
        assert_eq!(outcome.result, json!(["limit=10"]));
    }

    #[test]
    fn duplicate_and_malformed_paths_fail_the_build() {
        let noop = || Procedure::query(LIST, |_ctx, _page: Page| async { Ok::<_, HandlerError>(vec![]) });
        assert_eq!(
            Registry::builder().merge([noop(), noop()]).build().unwrap_err(),
            RegistryError::DuplicatePath("note.list")
        );

        const BAD: QueryDescriptor<(), ()> = QueryDescriptor::new("nodot");
        let err = Registry::builder()
            .merge([Procedure::query(BAD, |_ctx, ()| async { Ok::<_, HandlerError>(()) })])
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::InvalidPath("nodot"));
    }
}
