//! Low-level bollard wrappers for the per-app runtime container, grounded on
//! `environment/docker/{container,power}.rs` and generalized from "one
//! container per game server" to "one container per application".

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, HealthConfig, HealthStatusEnum, HostConfig, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{ContainerHealth, OrchestratorError, OrchestratorResult};

pub async fn ensure_image_exists(docker: &Docker, image: &str) -> OrchestratorResult<()> {
    match docker.inspect_image(image).await {
        Ok(_) => return Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
            info!(image, "runtime image not found locally, pulling");
        }
        Err(e) => warn!(image, error = %e, "error inspecting image, attempting pull anyway"),
    }

    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };
    let mut stream = docker.create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        result.map_err(|e| OrchestratorError::ImagePull(e.to_string()))?;
    }
    Ok(())
}

pub async fn build_image(docker: &Docker, context_path: &std::path::Path, tag: &str) -> OrchestratorResult<()> {
    use bollard::image::BuildImageOptions;

    let tarball = tar_directory(context_path).map_err(|e| OrchestratorError::ImageBuild(e.to_string()))?;

    let options = BuildImageOptions {
        t: tag,
        rm: true,
        ..Default::default()
    };
    let mut stream = docker.build_image(options, None, Some(tarball.into()));
    while let Some(result) = stream.next().await {
        match result {
            Ok(info) => {
                if let Some(err) = info.error {
                    return Err(OrchestratorError::ImageBuild(err));
                }
            }
            Err(e) => return Err(OrchestratorError::ImageBuild(e.to_string())),
        }
    }
    Ok(())
}

fn tar_directory(path: &std::path::Path) -> std::io::Result<bytes::Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", path)?;
    let bytes = builder.into_inner()?;
    Ok(bytes::Bytes::from(bytes))
}

pub struct CreateSpec<'a> {
    pub container_name: &'a str,
    pub image: &'a str,
    pub network: &'a str,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub runtime_port: u16,
    pub memory_limit_mb: u64,
    pub dev_mount: Option<(String, String)>,
    /// Host directory holding the shared document-store sqlite file (plus
    /// its `-wal`/`-shm` siblings), bind-mounted read-write so the runtime
    /// process can open the same store the controller writes to (see
    /// `runtime::poll::PollingBridge`, which assumes shared-file access).
    pub document_store_mount: (String, String),
}

pub async fn create_container(docker: &Docker, spec: &CreateSpec<'_>) -> OrchestratorResult<()> {
    ensure_image_exists(docker, spec.image).await?;

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(format!("{}/tcp", spec.runtime_port), HashMap::new());

    let mut mounts = vec![bollard::models::Mount {
        source: Some(spec.document_store_mount.0.clone()),
        target: Some(spec.document_store_mount.1.clone()),
        typ: Some(bollard::models::MountTypeEnum::BIND),
        read_only: Some(false),
        ..Default::default()
    }];
    if let Some((source, target)) = &spec.dev_mount {
        mounts.push(bollard::models::Mount {
            source: Some(source.clone()),
            target: Some(target.clone()),
            typ: Some(bollard::models::MountTypeEnum::BIND),
            read_only: Some(true),
            ..Default::default()
        });
    }
    let mounts = Some(mounts);

    let host_config = HostConfig {
        network_mode: Some(spec.network.to_string()),
        mounts,
        memory: if spec.memory_limit_mb > 0 {
            Some((spec.memory_limit_mb * 1024 * 1024) as i64)
        } else {
            None
        },
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        cap_drop: Some(vec!["ALL".to_string()]),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            ..Default::default()
        }),
        log_config: Some(bollard::models::HostConfigLogConfig {
            typ: Some("local".to_string()),
            config: Some({
                let mut cfg = HashMap::new();
                cfg.insert("max-size".to_string(), "5m".to_string());
                cfg.insert("max-file".to_string(), "2".to_string());
                cfg
            }),
        }),
        ..Default::default()
    };

    let health_config = HealthConfig {
        test: Some(vec![
            "CMD-SHELL".to_string(),
            format!(
                "wget -qO- http://127.0.0.1:{}/__runtime_health__ || exit 1",
                spec.runtime_port
            ),
        ]),
        interval: Some(2_000_000_000),
        timeout: Some(2_000_000_000),
        retries: Some(3),
        start_period: Some(2_000_000_000),
    };

    let config = Config {
        image: Some(spec.image.to_string()),
        hostname: Some(spec.container_name.to_string()),
        env: Some(spec.env.clone()),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone()),
        healthcheck: Some(health_config),
        host_config: Some(host_config),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.container_name,
        platform: None,
    };

    docker
        .create_container(Some(options), config)
        .await
        .map_err(|e| match e {
            bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => {
                OrchestratorError::AlreadyExists(spec.container_name.to_string())
            }
            other => OrchestratorError::Docker(other),
        })?;

    Ok(())
}

pub async fn start_container(docker: &Docker, name: &str) -> OrchestratorResult<()> {
    docker
        .start_container(name, None::<StartContainerOptions<String>>)
        .await
        .map_err(OrchestratorError::Docker)
}

pub async fn stop_container(docker: &Docker, name: &str) -> OrchestratorResult<()> {
    match docker.stop_container(name, None).await {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
        Err(e) => Err(OrchestratorError::Docker(e)),
    }
}

pub async fn restart_container(docker: &Docker, name: &str) -> OrchestratorResult<()> {
    docker
        .restart_container(name, None::<RestartContainerOptions>)
        .await
        .map_err(OrchestratorError::Docker)
}

pub async fn kill_container(docker: &Docker, name: &str) -> OrchestratorResult<()> {
    match docker
        .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
        .await
    {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
        Err(e) => Err(OrchestratorError::Docker(e)),
    }
}

pub async fn remove_container(docker: &Docker, name: &str) -> OrchestratorResult<()> {
    let options = RemoveContainerOptions {
        force: true,
        v: false,
        ..Default::default()
    };
    match docker.remove_container(name, Some(options)).await {
        Ok(()) => {
            debug!(name, "removed container");
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(e) => Err(OrchestratorError::Docker(e)),
    }
}

/// Best-effort stop + remove of a stale container of the given name, used at
/// the top of the start protocol to clear out anything left from a previous
/// failed attempt.
pub async fn destroy_stale(docker: &Docker, name: &str) {
    let _ = kill_container(docker, name).await;
    let _ = remove_container(docker, name).await;
}

pub async fn inspect_health(docker: &Docker, name: &str) -> OrchestratorResult<ContainerHealth> {
    let inspect = match docker.inspect_container(name, None).await {
        Ok(i) => i,
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
            return Ok(ContainerHealth::Absent)
        }
        Err(e) => return Err(OrchestratorError::Docker(e)),
    };

    let state = inspect.state.as_ref();
    let status = state.and_then(|s| s.status);
    let health_status = state
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status);

    Ok(match status {
        Some(ContainerStateStatusEnum::RUNNING) => match health_status {
            Some(HealthStatusEnum::HEALTHY) => ContainerHealth::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => ContainerHealth::Unhealthy,
            _ => ContainerHealth::Starting,
        },
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::RESTARTING) => {
            ContainerHealth::Starting
        }
        Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::PAUSED) => ContainerHealth::Stopped,
        _ => ContainerHealth::Stopped,
    })
}

/// Resolves the network to attach app containers to by inspecting the
/// controller's own container and reusing its first attached network,
/// falling back to the configured default when that's not possible (e.g.
/// running outside a container during development).
pub async fn resolve_network(docker: &Docker, own_container_id: Option<&str>, fallback: &str) -> String {
    let Some(id) = own_container_id else {
        return fallback.to_string();
    };
    match docker.inspect_container(id, None).await {
        Ok(inspect) => inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|nets| nets.keys().next().cloned())
            .unwrap_or_else(|| fallback.to_string()),
        Err(e) => {
            warn!(error = %e, "failed to inspect own container for network resolution, using fallback");
            fallback.to_string()
        }
    }
}

pub async fn list_container_names(docker: &Docker) -> OrchestratorResult<Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec!["hyac.managed=true".to_string()]);
    let options = ListContainersOptions {
        all: true,
        filters,
        ..Default::default()
    };
    let containers = docker
        .list_containers(Some(options))
        .await
        .map_err(OrchestratorError::Docker)?;
    Ok(containers
        .into_iter()
        .filter_map(|c| c.names)
        .flatten()
        .map(|n| n.trim_start_matches('/').to_string())
        .collect())
}

pub fn port_binding_map(container_port: u16, host_port: u16) -> HashMap<String, Option<Vec<PortBinding>>> {
    let mut map = HashMap::new();
    map.insert(
        format!("{container_port}/tcp"),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host_port.to_string()),
        }]),
    );
    map
}
