use axum::{Router, extract::State, response::Json as ResponseJson, routing::get};
use deployment::Deployment;
use serde::Serialize;
use utils::response::ApiResponse;

use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub ai_enabled: bool,
}

/// GET /api/health
pub async fn health(
    State(deployment): State<Deployment>,
) -> Result<ResponseJson<ApiResponse<HealthStatus>>, ApiError> {
    deployment.db().ping().await?;
    Ok(ResponseJson(ApiResponse::success(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ai_enabled: deployment.ai().is_configured(),
    })))
}

pub fn router(_deployment: &Deployment) -> Router<Deployment> {
    Router::new().route("/health", get(health))
}
