//! Container Orchestrator (§4.2): idempotent start/stop/restart/delete over
//! the per-app runtime container, plus the readiness + DNS-wait protocol.
//!
//! Grounded on `server/manager.rs`'s `DashMap<String, Arc<Server>>` registry
//! shape for the in-memory `running_apps` record, and on
//! `environment/docker/{container,power}.rs` for the bollard call sequence,
//! generalized from "game server process" to "FaaS runtime container".

mod docker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::blob::{BlobError, BlobStore};
use crate::config::Configuration;
use crate::db::{Application, Db, DbError};
use crate::net::{retry_with_backoff, wait_for_dns};
use crate::proxy::{ContainerStarter, ProxyError, ProxyResult, ProxySink, StartedContainer};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("image build failed: {0}")]
    ImageBuild(String),

    #[error("container {0} already exists")]
    AlreadyExists(String),

    #[error("application not found: {0}")]
    NotFound(String),

    #[error("readiness wait failed for {0}: container did not become healthy")]
    NotReady(String),

    #[error("dns wait failed for {0}")]
    DnsTimeout(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<OrchestratorError> for ProxyError {
    fn from(err: OrchestratorError) -> Self {
        ProxyError::StartFailed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHealth {
    Absent,
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunningApp {
    pub container_name: String,
    pub runtime_port: u16,
}

/// Registry of apps the orchestrator believes are currently running,
/// mirroring `Manager::servers` but keyed by `app_id` instead of server
/// UUID.
pub struct Orchestrator {
    docker: Docker,
    db: Arc<Db>,
    blob: Arc<BlobStore>,
    proxy: Arc<dyn ProxySink>,
    config: Arc<Configuration>,
    running_apps: DashMap<String, RunningApp>,
    own_container_id: Option<String>,
}

impl Orchestrator {
    pub fn new(
        docker: Docker,
        db: Arc<Db>,
        blob: Arc<BlobStore>,
        proxy: Arc<dyn ProxySink>,
        config: Arc<Configuration>,
    ) -> Self {
        let own_container_id = std::env::var("HOSTNAME").ok();
        Self {
            docker,
            db,
            blob,
            proxy,
            config,
            running_apps: DashMap::new(),
            own_container_id,
        }
    }

    pub fn is_running(&self, app_id: &str) -> bool {
        self.running_apps.contains_key(app_id)
    }

    pub fn running_app_ids(&self) -> Vec<String> {
        self.running_apps.iter().map(|r| r.key().clone()).collect()
    }

    /// Optional boot-time step (SPEC_FULL §10.5): build the runtime image
    /// from a local Dockerfile if the configured image isn't present.
    pub async fn ensure_runtime_image(&self) -> OrchestratorResult<()> {
        if let Some(context) = &self.config.docker.build_image_if_missing {
            match self.docker.inspect_image(&self.config.docker.runtime_image).await {
                Ok(_) => return Ok(()),
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                    info!(image = %self.config.docker.runtime_image, "building runtime image from local context");
                    docker::build_image(&self.docker, context, &self.config.docker.runtime_image).await?;
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            docker::ensure_image_exists(&self.docker, &self.config.docker.runtime_image).await?;
        }
        Ok(())
    }

    /// Start protocol (§4.2 steps 1-10). Idempotent: a second call while the
    /// app is already recorded as running just returns the existing record.
    pub async fn start_app(&self, app: &Application) -> OrchestratorResult<RunningApp> {
        if let Some(existing) = self.running_apps.get(&app.app_id) {
            return Ok(existing.clone());
        }

        let container_name = app.container_name();
        docker::destroy_stale(&self.docker, &container_name).await;

        self.ensure_prerequisites(app).await?;

        let network = docker::resolve_network(
            &self.docker,
            self.own_container_id.as_deref(),
            &self.config.docker.network,
        )
        .await;

        let runtime_port = self.config.docker.runtime_port;
        let labels = self.build_labels(app, &container_name, runtime_port);
        let env = self.build_env(app);

        let spec = docker::CreateSpec {
            container_name: &container_name,
            image: &self.config.docker.runtime_image,
            network: &network,
            env,
            labels,
            runtime_port,
            memory_limit_mb: self.config.docker.memory_overhead_mb,
            dev_mount: self.dev_mount(app),
            document_store_mount: self.document_store_mount(),
        };

        if let Err(e) = docker::create_container(&self.docker, &spec).await {
            warn!(app_id = %app.app_id, error = %e, "failed to create runtime container");
            return Err(e);
        }

        if let Err(e) = self.bring_up(&container_name, runtime_port).await {
            warn!(app_id = %app.app_id, error = %e, "start protocol failed, rolling back container");
            docker::kill_container(&self.docker, &container_name).await.ok();
            docker::remove_container(&self.docker, &container_name).await.ok();
            return Err(e);
        }

        if let Err(e) = self
            .proxy
            .write_route(app, &container_name, runtime_port, &self.config.api.base_domain)
            .await
        {
            warn!(app_id = %app.app_id, error = %e, "proxy route write failed, leaving container up for debugging");
        }

        let running = RunningApp {
            container_name: container_name.clone(),
            runtime_port,
        };
        self.running_apps.insert(app.app_id.clone(), running.clone());
        info!(app_id = %app.app_id, container = %container_name, "application started");
        Ok(running)
    }

    async fn bring_up(&self, container_name: &str, runtime_port: u16) -> OrchestratorResult<()> {
        docker::start_container(&self.docker, container_name).await?;

        let attempts = self.config.docker.readiness_attempts;
        let interval = Duration::from_secs(self.config.docker.readiness_interval_secs);
        let docker = self.docker.clone();
        let name = container_name.to_string();
        retry_with_backoff("readiness", attempts, interval, move || {
            let docker = docker.clone();
            let name = name.clone();
            async move {
                match docker::inspect_health(&docker, &name).await {
                    Ok(ContainerHealth::Healthy) => Ok(()),
                    Ok(ContainerHealth::Unhealthy) => {
                        Err(OrchestratorError::NotReady(name.clone()))
                    }
                    Ok(_) => Err(OrchestratorError::NotReady(name.clone())),
                    Err(e) => Err(e),
                }
            }
        })
        .await
        .map_err(|_| OrchestratorError::NotReady(container_name.to_string()))?;

        wait_for_dns(
            container_name,
            runtime_port,
            self.config.docker.dns_attempts,
            Duration::from_secs(self.config.docker.dns_interval_secs),
        )
        .await
        .map_err(|_| OrchestratorError::DnsTimeout(container_name.to_string()))?;

        Ok(())
    }

    async fn ensure_prerequisites(&self, app: &Application) -> OrchestratorResult<()> {
        self.ensure_dedicated_database(app).await?;
        self.blob.ensure_bucket(&app.data_bucket()).await?;
        self.blob.ensure_bucket(&app.web_bucket()).await?;
        self.blob.set_public_read_policy(&app.web_bucket()).await?;
        Ok(())
    }

    /// Sqlite stands in for the excluded document database (DESIGN.md); a
    /// "dedicated database" for an app is realized as its own sqlite file
    /// under `<data_directory>/apps/<app_id_lc>.sqlite3`, created empty if
    /// missing. `app.db_password` is still generated at app-creation time and
    /// handed to the runtime container as `APP_DB_PASSWORD`, matching the
    /// original's credential-provisioning shape even though sqlite itself
    /// doesn't enforce it.
    async fn ensure_dedicated_database(&self, app: &Application) -> OrchestratorResult<()> {
        let dir = self.config.system.data_directory.join("apps");
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            OrchestratorError::ImageBuild(format!("failed to create apps data dir: {e}"))
        })?;
        let path = dir.join(format!("{}.sqlite3", app.app_id_lc()));
        if !path.exists() {
            tokio::fs::File::create(&path).await.map_err(|e| {
                OrchestratorError::ImageBuild(format!("failed to create app database file: {e}"))
            })?;
        }
        Ok(())
    }

    fn build_labels(
        &self,
        app: &Application,
        container_name: &str,
        runtime_port: u16,
    ) -> HashMap<String, String> {
        let mut labels =
            crate::proxy::container_labels(app, container_name, runtime_port, &self.config.api.base_domain);
        labels.insert("hyac.managed".to_string(), "true".to_string());
        labels.insert("hyac.app_id".to_string(), app.app_id.clone());
        labels
    }

    fn build_env(&self, app: &Application) -> Vec<String> {
        let store_filename = self
            .config
            .document_store
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hyac.sqlite3".to_string());
        let mut env = vec![
            format!("APP_ID={}", app.app_id),
            format!("APP_DB_PASSWORD={}", app.db_password),
            format!("APP_DATA_BUCKET={}", app.data_bucket()),
            format!("APP_WEB_BUCKET={}", app.web_bucket()),
            format!("BLOB_ENDPOINT={}", self.config.blob.endpoint),
            format!("BLOB_ACCESS_KEY={}", self.config.blob.access_key),
            format!("BLOB_SECRET_KEY={}", self.config.blob.secret_key),
            format!("RUNTIME_PORT={}", self.config.docker.runtime_port),
            format!("DOCUMENT_STORE_PATH=/hyac/store/{store_filename}"),
        ];
        for var in &app.environment_variables {
            env.push(format!("{}={}", var.key, var.value));
        }
        env
    }

    /// Host directory backing the shared document store, bind-mounted into
    /// every runtime container at a fixed path (§4.6: the runtime and
    /// controller share nothing but this file).
    fn document_store_mount(&self) -> (String, String) {
        let host_dir = self
            .config
            .document_store
            .path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        (host_dir, "/hyac/store".to_string())
    }

    fn dev_mount(&self, _app: &Application) -> Option<(String, String)> {
        if self.config.system.dev_mode {
            self.config
                .system
                .dev_source_path
                .as_ref()
                .map(|p| (p.display().to_string(), "/opt/hyac/dev".to_string()))
        } else {
            None
        }
    }

    /// Stop protocol: remove proxy route, remove the container, drop the
    /// in-memory record. Treated as success if the container wasn't running.
    pub async fn stop_app(&self, app: &Application) -> OrchestratorResult<()> {
        let container_name = app.container_name();

        if let Err(e) = self.proxy.remove_route(&app.app_id_lc()).await {
            warn!(app_id = %app.app_id, error = %e, "failed to remove proxy route during stop");
        }

        docker::stop_container(&self.docker, &container_name).await?;
        docker::remove_container(&self.docker, &container_name).await?;
        self.running_apps.remove(&app.app_id);
        info!(app_id = %app.app_id, "application stopped");
        Ok(())
    }

    pub async fn restart_app(&self, app: &Application) -> OrchestratorResult<RunningApp> {
        self.stop_app(app).await?;
        self.start_app(app).await
    }

    /// Delete protocol (§4.2): best-effort, continuing past individual
    /// failures and logging each.
    pub async fn delete_app(&self, app: &Application) -> OrchestratorResult<()> {
        if let Err(e) = self.stop_app(app).await {
            warn!(app_id = %app.app_id, error = %e, "failed to stop container during delete, continuing");
        }

        if let Err(e) = self.db.delete_functions_by_app(&app.app_id).await {
            warn!(app_id = %app.app_id, error = %e, "failed to delete functions during app delete, continuing");
        }

        if let Err(e) = self.blob.delete_bucket_recursive(&app.data_bucket()).await {
            warn!(app_id = %app.app_id, error = %e, "failed to empty data bucket during delete, continuing");
        }
        if let Err(e) = self.blob.delete_bucket_recursive(&app.web_bucket()).await {
            warn!(app_id = %app.app_id, error = %e, "failed to empty web bucket during delete, continuing");
        }

        let db_path = self
            .config
            .system
            .data_directory
            .join("apps")
            .join(format!("{}.sqlite3", app.app_id_lc()));
        if let Err(e) = tokio::fs::remove_file(&db_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(app_id = %app.app_id, error = %e, "failed to remove dedicated database file, continuing");
            }
        }

        if let Err(e) = self.db.delete_application(&app.app_id).await {
            warn!(app_id = %app.app_id, error = %e, "failed to delete application document");
        }

        info!(app_id = %app.app_id, "application deleted");
        Ok(())
    }

    /// Used by the status reconciler: observed container health mapped to
    /// the §4.4 table, independent of the in-memory `running_apps` record.
    pub async fn observe_health(&self, app: &Application) -> OrchestratorResult<ContainerHealth> {
        docker::inspect_health(&self.docker, &app.container_name()).await
    }

    pub async fn live_container_names(&self) -> OrchestratorResult<Vec<String>> {
        docker::list_container_names(&self.docker).await
    }
}

#[async_trait]
impl ContainerStarter for Orchestrator {
    async fn ensure_started(&self, app_id: &str) -> ProxyResult<StartedContainer> {
        if let Some(running) = self.running_apps.get(app_id) {
            return Ok(StartedContainer {
                container_name: running.container_name.clone(),
                runtime_port: running.runtime_port,
            });
        }

        let app = self
            .db
            .get_application(app_id)
            .await
            .map_err(|e| ProxyError::StartFailed(e.to_string()))?
            .ok_or_else(|| ProxyError::AppNotFound(app_id.to_string()))?;

        let running = self.start_app(&app).await?;
        let _ = self
            .db
            .update_application_status(app_id, crate::db::AppStatus::Running)
            .await;

        Ok(StartedContainer {
            container_name: running.container_name,
            runtime_port: running.runtime_port,
        })
    }
}
