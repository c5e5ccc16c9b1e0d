use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderValue, StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use deployment::Deployment;
use rpc::RequestScope;
use services::services::auth::SESSION_COOKIE;
use tracing::Instrument;
use utils::cookie;

pub const SIGN_IN_PATH: &str = "/sign-in";

/// The current request's scope, installed by [`request_scope`].
#[derive(Clone)]
pub struct Scope(pub Arc<RequestScope>);

impl<S: Send + Sync> FromRequestParts<S> for Scope {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Scope>().cloned().ok_or_else(|| {
            tracing::error!("Request scope middleware is not installed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }
}

/// Open a request scope for the lifetime of the request and tag its span and response
/// with the request id.
pub async fn request_scope(
    State(deployment): State<Deployment>,
    mut request: Request,
    next: Next,
) -> Response {
    let scope = Arc::new(deployment.contexts().begin(request.headers().clone()));
    let request_id = scope.id();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        route = %request.uri().path(),
    );
    request.extensions_mut().insert(Scope(scope));

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Send visitors without a session cookie to the sign-in page.
pub async fn require_session_cookie(request: Request, next: Next) -> Response {
    if cookie::read_cookie(request.headers(), SESSION_COOKIE).is_none() {
        return Redirect::to(SIGN_IN_PATH).into_response();
    }
    next.run(request).await
}
