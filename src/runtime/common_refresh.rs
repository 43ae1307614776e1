//! Bridges the function watcher's synchronous [`crate::watchers::CacheInvalidator`]
//! callbacks to the async work a refresh actually requires: re-listing an
//! app's published `common` functions, recompiling each, and repopulating
//! [`CommonNamespace`] (§4.6 `context.common`). The callbacks only signal a
//! channel; a background task drains it and does the real work, so a
//! change-feed dispatch never blocks on a compile.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::db::Db;
use crate::watchers::CacheInvalidator;

use super::cache::CodeCache;
use super::compiler::Compiler;
use super::context::CommonNamespace;

pub struct RuntimeCacheBridge {
    cache: Arc<CodeCache>,
    refresh_tx: UnboundedSender<()>,
}

impl RuntimeCacheBridge {
    /// Returns the bridge plus the receiving end of its refresh channel;
    /// callers hand the receiver to [`run_common_refresh_task`].
    pub fn new(cache: Arc<CodeCache>) -> (Self, UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                cache,
                refresh_tx: tx,
            },
            rx,
        )
    }

    fn signal_refresh(&self) {
        // An unbounded channel with a coalescing consumer never needs more
        // than one pending signal; a full mailbox just means a refresh is
        // already queued.
        let _ = self.refresh_tx.send(());
    }
}

impl CacheInvalidator for RuntimeCacheBridge {
    fn invalidate(&self, app_id: &str, function_id: &str) {
        self.cache.invalidate(app_id, function_id);
        self.signal_refresh();
    }

    fn invalidate_all(&self, app_id: &str) {
        self.cache.invalidate_app(app_id);
        self.signal_refresh();
    }
}

/// Drains refresh signals and re-synchronizes [`CommonNamespace`] against
/// the document store. Multiple signals that arrive before a refresh
/// finishes are coalesced into the next run rather than queued individually.
pub async fn run_common_refresh_task(
    mut rx: UnboundedReceiver<()>,
    db: Arc<Db>,
    app_id: String,
    common: Arc<CommonNamespace>,
    compiler: Arc<dyn Compiler>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            signal = rx.recv() => {
                if signal.is_none() {
                    return;
                }
                while rx.try_recv().is_ok() {}
                if let Err(e) = refresh_common(&db, &app_id, &common, compiler.as_ref()).await {
                    warn!(app_id = %app_id, error = %e, "common namespace refresh failed");
                }
            }
        }
    }
}

/// One-shot synchronous refresh, used at runtime boot so the common
/// namespace is populated before `/__runtime_health__` reports ready,
/// instead of waiting on the first signal through the refresh channel.
pub async fn refresh_common(
    db: &Db,
    app_id: &str,
    common: &CommonNamespace,
    compiler: &dyn Compiler,
) -> Result<(), crate::db::DbError> {
    let published = db.list_published_common(app_id).await?;
    let mut seen = std::collections::HashSet::new();

    for function in &published {
        let module_key = format!("{app_id}::{}::common", function.function_id);
        match compiler.compile(&module_key, function).await {
            Ok(artifact) => {
                common.set(&function.function_name, Arc::new(artifact));
                seen.insert(function.function_name.clone());
            }
            Err(e) => {
                warn!(
                    app_id = %app_id,
                    function_id = %function.function_id,
                    error = %e,
                    "failed to recompile common function during refresh"
                );
            }
        }
    }

    common.retain_only(&seen);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FunctionStatus, FunctionType, HyacFunction};
    use crate::runtime::compiler::DeclaredSignatureCompiler;
    use std::time::Duration;

    fn common_function(id: &str, name: &str) -> HyacFunction {
        HyacFunction {
            function_id: id.to_string(),
            function_name: name.to_string(),
            app_id: "app1".to_string(),
            function_type: FunctionType::Common,
            status: FunctionStatus::Published,
            code: "def handler(): pass".to_string(),
            tags: vec![],
            users: vec![],
            timeout: 30,
            memory_limit: 128,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn refresh_populates_then_prunes_removed_functions() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.insert_function(&common_function("f1", "helper")).await.unwrap();

        let common = Arc::new(CommonNamespace::default());
        refresh_common(&db, "app1", &common, &DeclaredSignatureCompiler)
            .await
            .unwrap();
        assert!(common.get("helper").is_some());

        db.delete_function("f1").await.unwrap();
        refresh_common(&db, "app1", &common, &DeclaredSignatureCompiler)
            .await
            .unwrap();
        assert!(common.get("helper").is_none());
    }

    #[tokio::test]
    async fn cache_bridge_invalidate_signals_refresh_channel() {
        let cache = Arc::new(CodeCache::with_defaults());
        let (bridge, mut rx) = RuntimeCacheBridge::new(cache);
        bridge.invalidate("app1", "f1");
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("refresh signal should arrive")
            .expect("channel should remain open");
    }
}
