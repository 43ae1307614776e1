//! Controller entry point: the control plane (§2). Boots the document
//! store, blob adapter, container engine client, and proxy sink; brings the
//! task worker and status reconciler up; wires the Management API plus the
//! lazy-start catch-all; serves until a shutdown signal drains in-flight
//! background tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use bollard::Docker;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blob::BlobStore;
use crate::config::{Configuration, DockerConfiguration};
use crate::db::Db;
use crate::orchestrator::Orchestrator;
use crate::proxy::{LazyStartProxy, NginxFileSink, ProxySink};
use crate::reconciler::Reconciler;
use crate::scheduler::Scheduler;
use crate::web::{self, AppState};
use crate::worker::Worker;

fn connect_docker(cfg: &DockerConfiguration) -> Result<Docker> {
    if let Some(path) = cfg.socket.strip_prefix("unix://") {
        Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
            .context("failed to connect to docker over unix socket")
    } else if let Some(path) = cfg.socket.strip_prefix("npipe://") {
        Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION)
            .context("failed to connect to docker over named pipe")
    } else {
        Docker::connect_with_local_defaults().context("failed to connect to docker")
    }
}

pub async fn run(config_path: &str) -> Result<()> {
    info!(config_path, "loading controller configuration");
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    let db = Arc::new(
        Db::open(&config.document_store.path)
            .context("failed to open document store")?,
    );
    let blob = Arc::new(BlobStore::new(&config.blob).context("failed to initialize blob store")?);
    let dynamic_db = Arc::new(crate::db::DynamicDb::new(config.system.data_directory.clone()));
    let docker = connect_docker(&config.docker)?;

    let proxy_sink: Arc<dyn ProxySink> = match &config.proxy.dynamic_config_dir {
        Some(dir) => Arc::new(NginxFileSink::new(dir.clone(), config.proxy.reload_command.clone())),
        None => {
            return Err(anyhow::anyhow!(
                "proxy.dynamic_config_dir must be set: this deployment uses the file-based proxy sink"
            ))
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        docker,
        db.clone(),
        blob.clone(),
        proxy_sink,
        config.clone(),
    ));
    orchestrator.ensure_runtime_image().await.context("failed to ensure runtime image is present")?;

    let worker = Arc::new(Worker::new(db.clone(), orchestrator.clone()));
    worker.boot().await.context("worker boot-time reconciliation failed")?;

    let reconciler = Arc::new(Reconciler::new(db.clone(), orchestrator.clone()));

    let http_client = crate::net::shared_http_client(Duration::from_secs(30));
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        orchestrator.clone(),
        http_client.clone(),
        config.docker.runtime_port,
    ));
    scheduler.boot().await.context("scheduler boot failed")?;

    let lazy_proxy = Arc::new(LazyStartProxy::new(
        db.clone(),
        orchestrator.clone(),
        http_client.clone(),
        config.api.base_domain.clone(),
    ));

    let state = AppState {
        db: db.clone(),
        blob,
        orchestrator,
        scheduler,
        lazy_proxy,
        config: config.clone(),
        http_client,
    };
    let app = web::build_router(state);

    let shutdown_token = CancellationToken::new();

    let worker_task = {
        let worker = worker.clone();
        let token = shutdown_token.clone();
        tokio::spawn(async move { worker.run(token).await })
    };
    let reconciler_task = {
        let reconciler = reconciler.clone();
        let token = shutdown_token.clone();
        tokio::spawn(async move { reconciler.run(token).await })
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("invalid api.host/api.port")?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_token_clone = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
            return;
        }
        warn!("shutdown signal received, draining background tasks");
        shutdown_token_clone.cancel();
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    if config.api.ssl.enabled {
        info!(%bind_addr, "starting controller HTTPS server");
        let tls_config = RustlsConfig::from_pem_file(&config.api.ssl.cert, &config.api.ssl.key)
            .await
            .context("failed to load TLS configuration")?;
        axum_server::bind_rustls(bind_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        info!(%bind_addr, "starting controller HTTP server");
        axum_server::bind(bind_addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    let _ = tokio::join!(worker_task, reconciler_task);
    info!("controller stopped");
    Ok(())
}
