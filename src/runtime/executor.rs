//! Function execution. The function programming model and its
//! interpretation are an excluded, peripheral collaborator (§1); this trait
//! is the seam a concrete language runtime plugs into — a WASM host, a
//! subprocess worker pool, or any other sandboxed executor (Design Note
//! 9.1). [`EchoExecutor`] is the wiring-complete default used when no
//! language runtime is configured, so the rest of the dispatch pipeline
//! (cache, context, metrics, logging) is exercised end-to-end without one.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use super::compiler::CompiledArtifact;
use super::context::RuntimeContext;

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("{exception_type}: {detail}")]
    UserException {
        exception_type: String,
        detail: String,
        is_client_error: bool,
    },

    #[error("execution timed out after {0}s")]
    Timeout(u64),
}

pub struct InvocationOutcome {
    pub body: Value,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn invoke(
        &self,
        artifact: &CompiledArtifact,
        context: Arc<RuntimeContext>,
        bound_args: Value,
        raw_body: Option<bytes::Bytes>,
    ) -> Result<InvocationOutcome, InvocationError>;
}

/// Echoes the bound arguments back as the response body. Useful both as a
/// working default and for exercising the pipeline in tests without a real
/// language runtime attached.
pub struct EchoExecutor;

#[async_trait]
impl FunctionExecutor for EchoExecutor {
    async fn invoke(
        &self,
        artifact: &CompiledArtifact,
        context: Arc<RuntimeContext>,
        bound_args: Value,
        raw_body: Option<bytes::Bytes>,
    ) -> Result<InvocationOutcome, InvocationError> {
        Ok(InvocationOutcome {
            body: json!({
                "module": artifact.module_key,
                "func_id": context.func_id,
                "args": bound_args,
                "has_body": raw_body.is_some(),
            }),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
