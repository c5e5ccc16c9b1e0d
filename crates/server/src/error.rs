use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rpc::{HandlerCode, RpcError};
use services::services::auth::AuthError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to encode page state: {0}")]
    PageState(#[from] serde_json::Error),
}

/// HTTP status for a procedure failure.
pub fn rpc_status(error: &RpcError) -> StatusCode {
    match error {
        RpcError::Validation { .. } => StatusCode::BAD_REQUEST,
        RpcError::Unauthorized => StatusCode::UNAUTHORIZED,
        RpcError::Handler { code, .. } => match code {
            HandlerCode::NotFound => StatusCode::NOT_FOUND,
            HandlerCode::BadRequest => StatusCode::BAD_REQUEST,
            HandlerCode::Upstream => StatusCode::BAD_GATEWAY,
            HandlerCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
        RpcError::UnknownProcedure { .. } => StatusCode::NOT_FOUND,
        RpcError::MethodNotSupported { .. } => StatusCode::METHOD_NOT_ALLOWED,
        RpcError::Network { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_type = match self {
            ApiError::Rpc(error) => {
                let status = rpc_status(&error);
                let message = error.to_string();
                return (
                    status,
                    Json(ApiResponse::<(), RpcError>::error_with_data(error, message)),
                )
                    .into_response();
            }
            ApiError::Auth(AuthError::Validation(issues)) => {
                let error = RpcError::validation(issues);
                let message = error.to_string();
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::<(), RpcError>::error_with_data(error, message)),
                )
                    .into_response();
            }
            ApiError::Auth(ref e @ (AuthError::EmailTaken | AuthError::InvalidCredentials)) => {
                let status = match e {
                    AuthError::EmailTaken => StatusCode::CONFLICT,
                    _ => StatusCode::UNAUTHORIZED,
                };
                return (status, Json(ApiResponse::<()>::error(&e.to_string()))).into_response();
            }
            ApiError::Auth(ref e) => {
                tracing::error!(error = %e, "Auth service failed");
                "AuthError"
            }
            ApiError::Database(ref e) => {
                tracing::error!(error = %e, "Database query failed");
                "DatabaseError"
            }
            ApiError::PageState(ref e) => {
                tracing::error!(error = %e, "Page state failed to encode");
                "RenderError"
            }
        };
        let response = ApiResponse::<()>::error(&format!("{}: internal server error", error_type));
        (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use rpc::FieldIssue;

    use super::*;

    #[test]
    fn auth_failures_keep_their_status() {
        let status = |e: AuthError| ApiError::Auth(e).into_response().status();
        assert_eq!(status(AuthError::EmailTaken), StatusCode::CONFLICT);
        assert_eq!(status(AuthError::InvalidCredentials), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status(AuthError::Validation(vec![FieldIssue::new("email", "bad")])),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(AuthError::UnknownUser(uuid::Uuid::nil())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn statuses_follow_the_error_kind() {
        assert_eq!(rpc_status(&RpcError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(rpc_status(&RpcError::validation(vec![])), StatusCode::BAD_REQUEST);
        assert_eq!(
            rpc_status(&RpcError::MethodNotSupported { path: "post.create".into() }),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            rpc_status(&RpcError::Handler {
                code: HandlerCode::Upstream,
                message: "upstream service unavailable".into(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            rpc_status(&RpcError::UnknownProcedure { path: "x.y".into() }),
            StatusCode::NOT_FOUND
        );
    }
}
