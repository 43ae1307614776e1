//! Crate-wide error type and the `{code, msg, data}` HTTP envelope.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{blob::BlobError, db::DbError, orchestrator::OrchestratorError, proxy::ProxyError};

/// Aggregated controller-surface error, converted to the envelope form at
/// the HTTP boundary. Subsystem errors plug in via `#[from]`, mirroring the
/// teacher's per-module error enums (`ManagerError`, `EnvironmentError`, ...)
/// feeding one edge conversion.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Bad input or an illegal application-state transition.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested entity absent or not owned by the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate name, or an operation already in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// Missing critical configuration; the caller should abort startup.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Stable non-zero numeric code per the `{code, msg, data}` wire
    /// contract (§6). `0` always means success and is never produced here.
    pub fn code(&self) -> i32 {
        match self {
            ControllerError::Validation(_) => 1001,
            ControllerError::NotFound(_) => 1002,
            ControllerError::Conflict(_) => 1003,
            ControllerError::Db(_) => 1004,
            ControllerError::Blob(_) => 1005,
            ControllerError::Orchestrator(_) => 1006,
            ControllerError::Proxy(_) => 1007,
            ControllerError::Upstream(_) => 1008,
            ControllerError::Fatal(_) => 1009,
            ControllerError::Internal(_) => 1010,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ControllerError::Validation(_) => StatusCode::OK,
            ControllerError::NotFound(_) => StatusCode::OK,
            ControllerError::Conflict(_) => StatusCode::OK,
            ControllerError::Db(_)
            | ControllerError::Blob(_)
            | ControllerError::Orchestrator(_)
            | ControllerError::Proxy(_)
            | ControllerError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControllerError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControllerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Standard response envelope mandated by §6: `code == 0` means success.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub code: i32,
    pub msg: String,
    pub data: Value,
}

impl Envelope {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            code: 0,
            msg: "success".into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            code: 0,
            msg: "success".into(),
            data: Value::Null,
        }
    }

    pub fn err(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: Value::Null,
        }
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, code = self.code(), "request failed");
        let status = self.status();
        let body = Envelope::err(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}

pub type ControllerResult<T> = std::result::Result<T, ControllerError>;
