//! Request-scoped procedure calls, the query cache they feed, and the bridge that
//! carries a server-rendered cache into the client.

pub mod api;
pub mod cache;
pub mod client;
pub mod context;
pub mod error;
pub mod hydration;
pub mod key;
pub mod procedure;
pub mod registry;
pub mod session;
pub mod validate;

pub use cache::{QueryCache, QueryFilter, QueryObserver, QueryOptions, QueryState, StaleTime};
pub use client::{QueryHandle, QueryStatus, RpcClient};
pub use context::{Authed, ContextFactory, RequestContext, RequestId, RequestScope};
pub use error::{FieldIssue, HandlerCode, HandlerError, RpcError};
pub use hydration::{DehydratedQuery, DehydratedState, HydrationError, ServerPrefetcher};
pub use key::QueryKey;
pub use procedure::{AuthTier, MutationDescriptor, Procedure, ProcedureKind, QueryDescriptor};
pub use registry::{CallOutcome, Registry, RegistryBuilder, RegistryError};
pub use session::{AnonymousResolver, AuthSession, SessionResolver, SessionUser};
pub use validate::{Issues, Validate};
