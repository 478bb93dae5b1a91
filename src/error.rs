//! Crate-wide error type.
//!
//! Every fallible path in the control plane reports one of these variants so
//! that callers can decide between retry, requeue, and fail-terminal without
//! string matching. Kubernetes API errors are classified once, at the cluster
//! gateway boundary, and never leak raw through the reconcilers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request fields. Surfaced as 400 with details.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or invalid bearer token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Token is valid but the action is denied.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A sandbox, pool, profile, runtime, or file does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    /// Optimistic-concurrency loss on a status update. Retried internally;
    /// surfaced only when retries are exhausted.
    #[error("conflict updating {0}")]
    Conflict(String),

    /// Request rejected by the API rate limiter.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Cluster timeout, server-busy, or network failure. Retriable.
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// The declared runtime does not resolve to an available
    /// RuntimeEnvironment. Terminal for the sandbox.
    #[error("runtime {0:?} is not available")]
    RuntimeNotFound(String),

    /// Terminal condition that is not a missing runtime (profile missing,
    /// seccomp profile absent, and the like).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// An operation succeeded partially and its rollback also failed.
    #[error("operation partially succeeded: {operation}: {cause}")]
    Compensation { operation: String, cause: String },

    /// The sandbox must be Running for this operation.
    #[error("sandbox {0} is not running")]
    SandboxNotRunning(String),

    /// Reserved for placeholder operations.
    #[error("not implemented")]
    NotImplemented,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Whether a reconciler should requeue the work item with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Conflict(_) | Error::Database(_) | Error::Cache(_)
        )
    }

    /// Whether the error is terminal for the resource: record a Failed
    /// condition and stop requeueing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::RuntimeNotFound(_) | Error::Permanent(_)
        )
    }

    /// Stable machine-readable code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "invalid_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::RateLimited => "rate_limited",
            Error::Transient(_) => "unavailable",
            Error::RuntimeNotFound(_) => "runtime_not_found",
            Error::Permanent(_) => "failed",
            Error::Compensation { .. } => "partial_failure",
            Error::SandboxNotRunning(_) => "sandbox_not_running",
            Error::NotImplemented => "not_implemented",
            Error::Database(_) | Error::Cache(_) | Error::Serde(_) | Error::Io(_) => "internal",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound { .. } | Error::RuntimeNotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::SandboxNotRunning(_) => StatusCode::CONFLICT,
            Error::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Error::Permanent(_)
            | Error::Compensation { .. }
            | Error::Database(_)
            | Error::Cache(_)
            | Error::Serde(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Classify a raw kube client error into the gateway's semantic categories.
///
/// 404 and 410 are NotFound, 409 is Conflict, 401/403 are Forbidden (the
/// service account is misconfigured; retrying cannot help), everything else
/// from the API server plus connection-level failures is Transient.
pub fn classify_kube(err: kube::Error, kind: &'static str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 | 410 => Error::not_found(kind, name),
            409 => Error::Conflict(format!("{kind}/{name}")),
            401 | 403 => Error::Forbidden(format!("{kind}/{name}: {}", ae.message)),
            429 => Error::Transient(format!("{kind}/{name}: server busy")),
            _ => Error::Transient(format!("{kind}/{name}: {}", ae.message)),
        },
        other => Error::Transient(format!("{kind}/{name}: {other}")),
    }
}

/// Standard error envelope: `{"error":{"code","message","details?"}}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
