use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware::{from_fn, from_fn_with_state},
};
use deployment::Deployment;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::middleware::{request_scope, require_session_cookie};

pub mod auth;
pub mod health;
pub mod pages;
pub mod trpc;

fn cors(deployment: &Deployment) -> CorsLayer {
    let origin = deployment.config().app_url.origin().ascii_serialization();
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);
    match HeaderValue::from_str(&origin) {
        Ok(origin) => layer.allow_origin(origin),
        Err(e) => {
            tracing::warn!(%origin, error = %e, "APP_URL origin is not a valid header; CORS disabled");
            layer
        }
    }
}

pub fn router(deployment: Deployment) -> Router {
    let api = Router::new()
        .merge(health::router(&deployment))
        .merge(auth::router(&deployment))
        .merge(trpc::router(&deployment));

    let pages = pages::protected_router(&deployment).layer(from_fn(require_session_cookie));

    Router::new()
        .nest("/api", api)
        .merge(pages)
        .merge(pages::public_router(&deployment))
        .layer(from_fn_with_state(deployment.clone(), request_scope))
        .layer(TraceLayer::new_for_http())
        .layer(cors(&deployment))
        .with_state(deployment)
}
