use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::get,
};
use deployment::Deployment;
use rpc::{CallOutcome, ProcedureKind, RpcError};
use serde::Deserialize;
use utils::response::ApiResponse;

use crate::{error::ApiError, middleware::Scope};

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    input: Option<String>,
}

/// GET /api/trpc/{path}?input=<json>
pub async fn query(
    State(deployment): State<Deployment>,
    Scope(scope): Scope,
    Path(path): Path<String>,
    Query(params): Query<QueryParams>,
) -> Result<ResponseJson<ApiResponse<CallOutcome, RpcError>>, ApiError> {
    let input = params.input.unwrap_or_default();
    let ctx = scope.context().await;
    let outcome = deployment
        .registry()
        .call_raw(ctx, ProcedureKind::Query, &path, input.as_bytes())
        .await?;
    Ok(ResponseJson(ApiResponse::success(outcome)))
}

/// POST /api/trpc/{path} with the input as the JSON body
pub async fn mutation(
    State(deployment): State<Deployment>,
    Scope(scope): Scope,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<ResponseJson<ApiResponse<CallOutcome, RpcError>>, ApiError> {
    let ctx = scope.context().await;
    let outcome = deployment
        .registry()
        .call_raw(ctx, ProcedureKind::Mutation, &path, &body)
        .await?;
    Ok(ResponseJson(ApiResponse::success(outcome)))
}

pub fn router(_deployment: &Deployment) -> Router<Deployment> {
    Router::new().route("/trpc/{path}", get(query).post(mutation))
}
