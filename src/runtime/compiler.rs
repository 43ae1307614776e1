//! Compilation (§4.6, Design Note 9.1): translating a function's declared
//! interface into a [`CompiledArtifact`] ready for invocation. The function
//! programming model and its interpretation are an excluded, peripheral
//! collaborator (§1) — what this module owns is the contract around that
//! collaborator: a declared parameter list instead of runtime reflection,
//! and a `handler` entry point convention checked declaratively rather than
//! by introspecting a loaded module.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::HyacFunction;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed for {0}: {1}")]
    Failed(String, String),
}

/// One compiled endpoint or common-function artifact, cached by
/// [`super::cache::CodeCache`] under `<app_id>::<identifier>[::"common"]`.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub module_key: String,
    /// Declared parameter names, in order. `"context"` and `"request"` are
    /// reserved names bound by the dispatcher rather than sourced from the
    /// request body/query; `"body"` requests the raw request body.
    pub params: Vec<String>,
    pub source: String,
    pub has_handler: bool,
}

/// Compiles function source into a [`CompiledArtifact`]. One implementation
/// per execution strategy an embedding chooses to plug in at
/// [`super::executor::FunctionExecutor`] (a WASM module host, a subprocess
/// worker pool, ...); this crate ships [`DeclaredSignatureCompiler`], which
/// performs no interpretation of `code` and instead treats the function's
/// declared metadata as the whole of compilation.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(
        &self,
        module_key: &str,
        function: &HyacFunction,
    ) -> Result<CompiledArtifact, CompileError>;
}

/// Default compiler: validates the source is non-empty, looks for a
/// `# params: a, b, c` declaration on one of the first few lines (falling
/// back to `context, request`), and checks for a `handler` entry point by
/// convention rather than reflection.
pub struct DeclaredSignatureCompiler;

#[async_trait]
impl Compiler for DeclaredSignatureCompiler {
    async fn compile(
        &self,
        module_key: &str,
        function: &HyacFunction,
    ) -> Result<CompiledArtifact, CompileError> {
        if function.code.trim().is_empty() {
            return Err(CompileError::Failed(
                module_key.to_string(),
                "empty source".to_string(),
            ));
        }

        Ok(CompiledArtifact {
            module_key: module_key.to_string(),
            params: parse_declared_params(&function.code),
            source: function.code.clone(),
            has_handler: function.code.to_ascii_lowercase().contains("handler"),
        })
    }
}

fn parse_declared_params(code: &str) -> Vec<String> {
    for line in code.lines().take(5) {
        let line = line.trim();
        let rest = line
            .strip_prefix("# params:")
            .or_else(|| line.strip_prefix("// params:"));
        if let Some(rest) = rest {
            let params: Vec<String> = rest
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !params.is_empty() {
                return params;
            }
        }
    }
    vec!["context".to_string(), "request".to_string()]
}

/// Subprocess/WASM artifact loader seam, shared with [`CompiledArtifact`]
/// by identity (`Arc`) so invalidation in the code cache drops the last
/// reference and frees whatever resources a concrete executor attached.
pub type SharedArtifact = Arc<CompiledArtifact>;

#[cfg(test)]
mod tests {
    use super::*;

    fn function(code: &str) -> HyacFunction {
        HyacFunction {
            function_id: "f1".into(),
            function_name: "hello".into(),
            app_id: "app1".into(),
            function_type: crate::db::FunctionType::Endpoint,
            status: crate::db::FunctionStatus::Published,
            code: code.to_string(),
            tags: vec![],
            users: vec![],
            timeout: 30,
            memory_limit: 128,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn defaults_params_when_undeclared() {
        let artifact = DeclaredSignatureCompiler
            .compile("app1::f1", &function("def handler(): pass"))
            .await
            .unwrap();
        assert_eq!(artifact.params, vec!["context", "request"]);
        assert!(artifact.has_handler);
    }

    #[tokio::test]
    async fn parses_declared_params() {
        let code = "# params: name, body\ndef handler(name, body): pass";
        let artifact = DeclaredSignatureCompiler
            .compile("app1::f1", &function(code))
            .await
            .unwrap();
        assert_eq!(artifact.params, vec!["name", "body"]);
    }

    #[tokio::test]
    async fn rejects_empty_source() {
        let err = DeclaredSignatureCompiler
            .compile("app1::f1", &function("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Failed(_, _)));
    }
}
