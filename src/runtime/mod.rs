//! Runtime process (§4.6): one per application. Loads published function
//! source on demand, compiles and caches it, dispatches HTTP requests
//! against it, and keeps its in-process environment and common-function
//! namespace converged with the document store via the cross-process
//! polling bridge ([`poll`]) when it isn't sharing a process with the
//! controller.

mod cache;
mod common_refresh;
mod compiler;
mod context;
mod dispatch;
mod env_apply;
mod executor;
mod poll;

pub use cache::{CacheEntry, CodeCache};
pub use common_refresh::{refresh_common, run_common_refresh_task, RuntimeCacheBridge};
pub use compiler::{CompileError, CompiledArtifact, Compiler, DeclaredSignatureCompiler, SharedArtifact};
pub use context::{
    BlobHandle, CommonNamespace, EnvFacade, NotificationDispatcher, OpenMode, RuntimeContext,
};
pub use dispatch::{router, RuntimeState};
pub use env_apply::RuntimeEnvApplier;
pub use executor::{EchoExecutor, FunctionExecutor, InvocationError, InvocationOutcome};
pub use poll::PollingBridge;
