use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerCode {
    NotFound,
    BadRequest,
    Upstream,
    Internal,
}

/// One violated input constraint. `path` is the dotted field path, empty for the whole input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Every failure that may cross the request boundary.
///
/// Handler internals are reduced to a safe message before they become an `RpcError`;
/// the full error is only ever logged server-side.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcError {
    #[error("input validation failed")]
    Validation { issues: Vec<FieldIssue> },
    #[error("unauthorized")]
    Unauthorized,
    #[error("{message}")]
    Handler { code: HandlerCode, message: String },
    #[error("no procedure named {path}")]
    UnknownProcedure { path: String },
    #[error("{path} does not support this method")]
    MethodNotSupported { path: String },
    #[error("network failure: {message}")]
    Network { message: String },
}

impl RpcError {
    pub fn validation(issues: Vec<FieldIssue>) -> Self {
        Self::Validation { issues }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// tRPC-style code string, also used as the log field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Handler { code, .. } => match code {
                HandlerCode::NotFound => "NOT_FOUND",
                HandlerCode::BadRequest => "BAD_REQUEST",
                HandlerCode::Upstream => "BAD_GATEWAY",
                HandlerCode::Internal => "INTERNAL_SERVER_ERROR",
            },
            Self::UnknownProcedure { .. } => "NOT_FOUND",
            Self::MethodNotSupported { .. } => "METHOD_NOT_SUPPORTED",
            Self::Network { .. } => "NETWORK_ERROR",
        }
    }

    /// Only transport failures are worth a caller-initiated retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// What procedure handlers return on failure.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    /// Log the full error and keep only what is safe to show a caller.
    pub fn into_rpc(self, path: &str) -> RpcError {
        match self {
            Self::NotFound(what) => RpcError::Handler {
                code: HandlerCode::NotFound,
                message: format!("{what} not found"),
            },
            Self::BadRequest(message) => RpcError::Handler {
                code: HandlerCode::BadRequest,
                message,
            },
            Self::Unauthorized => RpcError::Unauthorized,
            Self::Database(e) => {
                error!(path, error = %e, "Procedure failed with a database error");
                RpcError::Handler {
                    code: HandlerCode::Internal,
                    message: "internal server error".to_string(),
                }
            }
            Self::Upstream(e) => {
                warn!(path, error = %e, "Procedure failed calling an upstream service");
                RpcError::Handler {
                    code: HandlerCode::Upstream,
                    message: "upstream service unavailable".to_string(),
                }
            }
            Self::Internal(e) => {
                error!(path, error = ?e, "Procedure failed");
                RpcError::Handler {
                    code: HandlerCode::Internal,
                    message: "internal server error".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_are_not_forwarded() {
        let rpc = HandlerError::Database(sqlx::Error::RowNotFound).into_rpc("post.byId");
        assert_eq!(
            rpc,
            RpcError::Handler {
                code: HandlerCode::Internal,
                message: "internal server error".to_string(),
            }
        );
        assert!(!rpc.to_string().contains("no rows"));
    }

    #[test]
    fn wire_shape_is_tagged_by_kind() {
        let value = serde_json::to_value(RpcError::validation(vec![FieldIssue::new(
            "title",
            "must not be empty",
        )]))
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "kind": "validation",
                "issues": [{ "path": "title", "message": "must not be empty" }],
            })
        );

        let back: RpcError = serde_json::from_value(serde_json::json!({
            "kind": "handler",
            "code": "NOT_FOUND",
            "message": "post not found",
        }))
        .unwrap();
        assert_eq!(back.code(), "NOT_FOUND");
    }

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(RpcError::network("connection reset").is_retryable());
        assert!(!RpcError::Unauthorized.is_retryable());
        assert!(!RpcError::validation(vec![]).is_retryable());
    }
}
