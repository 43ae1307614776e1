//! Runtime entry point: the per-application data plane process (§2, §4.6).
//! Reads the environment the orchestrator injected into its container
//! (`APP_ID`, bucket names, blob credentials, the shared document-store
//! path), opens the document store the controller writes to, populates the
//! code cache and common namespace, starts the change watchers that keep
//! both converged, and serves the catch-all dispatch route.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::config::BlobConfiguration;
use crate::db::Db;
use crate::runtime::{
    refresh_common, router, CommonNamespace, DeclaredSignatureCompiler, EchoExecutor,
    RuntimeCacheBridge, RuntimeEnvApplier, RuntimeState,
};
use crate::watchers::{EnvironmentWatcher, FunctionWatcher};

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("required environment variable {key} is not set"))
}

pub async fn run() -> Result<()> {
    let app_id = require_env("APP_ID")?;
    let data_bucket = require_env("APP_DATA_BUCKET")?;
    let document_store_path = require_env("DOCUMENT_STORE_PATH")?;
    let runtime_port: u16 = std::env::var("RUNTIME_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8001);

    let blob_config = BlobConfiguration {
        endpoint: require_env("BLOB_ENDPOINT")?,
        access_key: require_env("BLOB_ACCESS_KEY")?,
        secret_key: require_env("BLOB_SECRET_KEY")?,
        region: std::env::var("BLOB_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        use_path_style: true,
    };

    info!(app_id, document_store_path, "booting runtime process");

    let db = Arc::new(
        Db::open(&document_store_path).context("failed to open shared document store")?,
    );
    let blob = Arc::new(BlobStore::new(&blob_config).context("failed to initialize blob adapter")?);

    if db.get_application(&app_id).await?.is_none() {
        warn!(app_id, "application document not found at boot; proceeding, cache misses will 404");
    }

    let cache = Arc::new(crate::runtime::CodeCache::with_defaults());
    let compiler: Arc<dyn crate::runtime::Compiler> = Arc::new(DeclaredSignatureCompiler);
    let executor: Arc<dyn crate::runtime::FunctionExecutor> = Arc::new(EchoExecutor);
    let common = Arc::new(CommonNamespace::default());

    // Populate the common namespace synchronously before declaring ready,
    // then hand the refresh channel to a background task for later signals.
    refresh_common(&db, &app_id, &common, compiler.as_ref())
        .await
        .context("initial common-namespace refresh failed")?;

    let (bridge, refresh_rx) = RuntimeCacheBridge::new(cache.clone());
    let bridge = Arc::new(bridge);
    let env_applier = Arc::new(RuntimeEnvApplier::new(app_id.clone()));

    let shutdown = CancellationToken::new();

    let poll_bridge = Arc::new(crate::runtime::PollingBridge::new(db.clone(), app_id.clone()));
    {
        let poll_bridge = poll_bridge.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move { poll_bridge.run(cancel).await });
    }

    {
        let feed_source = {
            let poll_bridge = poll_bridge.clone();
            move || poll_bridge.feed()
        };
        let watcher = FunctionWatcher::new(app_id.clone(), feed_source, bridge.clone());
        let cancel = shutdown.clone();
        tokio::spawn(async move { watcher.run(cancel).await });
    }
    {
        let feed_source = {
            let poll_bridge = poll_bridge.clone();
            move || poll_bridge.feed()
        };
        let watcher = EnvironmentWatcher::new(app_id.clone(), feed_source, env_applier.clone());
        let cancel = shutdown.clone();
        tokio::spawn(async move { watcher.run(cancel).await });
    }
    {
        let cancel = shutdown.clone();
        let db = db.clone();
        let app_id = app_id.clone();
        let common = common.clone();
        let compiler = compiler.clone();
        tokio::spawn(async move {
            crate::runtime::run_common_refresh_task(refresh_rx, db, app_id, common, compiler, cancel).await
        });
    }

    let http_client = crate::net::shared_http_client(std::time::Duration::from_secs(30));

    let state = Arc::new(RuntimeState {
        app_id: app_id.clone(),
        data_bucket,
        db,
        blob,
        cache,
        compiler,
        executor,
        common,
        http_client,
        ready: AtomicBool::new(true),
    });

    let app = router(state);
    let bind_addr: std::net::SocketAddr = format!("0.0.0.0:{runtime_port}").parse()?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind runtime listener on {bind_addr}"))?;

    info!(%bind_addr, app_id, "runtime process ready");

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        }
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("runtime HTTP server failed")?;

    Ok(())
}
