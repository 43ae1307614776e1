//! Proxy Config Sink & Lazy-Start Proxy (§4.3).
//!
//! Two cooperating pieces: the [`ProxySink`] trait materializes per-app
//! routing as a file the reverse proxy watches (primary mechanism, per
//! DESIGN.md Open Question (a)); [`lazy`] exposes the catch-all handler used
//! as the proxy's fallback for hosts it doesn't know about yet. Labels are
//! attached directly to the runtime container by the orchestrator as the
//! secondary, best-effort mechanism — see `orchestrator::lifecycle`.

mod nginx;
pub mod lazy;

pub use lazy::LazyStartProxy;
pub use nginx::NginxFileSink;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::Application;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error writing proxy config: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy reload command failed: {0}")]
    ReloadFailed(String),

    #[error("proxy config verification failed for {0}")]
    VerificationFailed(String),

    #[error("application not found: {0}")]
    AppNotFound(String),

    #[error("failed to bring up runtime container: {0}")]
    StartFailed(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Handle to a live runtime container, returned by [`ContainerStarter`] so
/// the lazy-start proxy knows where to forward the request without
/// depending on the orchestrator crate path directly (kept decoupled so
/// `orchestrator` can depend on `proxy`, not the reverse).
#[derive(Debug, Clone)]
pub struct StartedContainer {
    pub container_name: String,
    pub runtime_port: u16,
}

/// Implemented by the orchestrator; invoked by the lazy-start catch-all
/// handler to idempotently bring an application's runtime container up
/// before proxying the first request to it (§4.3).
#[async_trait]
pub trait ContainerStarter: Send + Sync {
    async fn ensure_started(&self, app_id: &str) -> ProxyResult<StartedContainer>;
}

/// A proxy integration that can materialize and remove the route for an
/// application. One concrete adapter ([`NginxFileSink`]) per DESIGN.md Open
/// Question (b); additional reverse proxies plug in here without touching
/// callers.
#[async_trait]
pub trait ProxySink: Send + Sync {
    /// Writes (or overwrites) the app's route: `Host(<app_id_lc>.<base_domain>)`
    /// -> `http://<container_name>:<runtime_port>`, plus the static "web"
    /// route with SPA fallback, then reloads the proxy.
    async fn write_route(
        &self,
        app: &Application,
        container_name: &str,
        runtime_port: u16,
        base_domain: &str,
    ) -> ProxyResult<()>;

    /// Removes the app's route file and reloads.
    async fn remove_route(&self, app_id_lc: &str) -> ProxyResult<()>;
}

/// Secondary best-effort mechanism: Traefik-style labels describing the
/// same route, attached directly to the runtime container so proxies that
/// discover routes via the container engine need no file at all (§4.3).
pub fn container_labels(
    app: &Application,
    container_name: &str,
    runtime_port: u16,
    base_domain: &str,
) -> std::collections::HashMap<String, String> {
    let mut labels = std::collections::HashMap::new();
    let router = format!("hyac-{}", app.app_id_lc());
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        format!("traefik.http.routers.{router}.rule"),
        format!("Host(`{}.{}`)", app.app_id_lc(), base_domain),
    );
    labels.insert(
        format!("traefik.http.routers.{router}.service"),
        router.clone(),
    );
    labels.insert(
        format!("traefik.http.services.{router}.loadbalancer.server.port"),
        runtime_port.to_string(),
    );
    labels.insert(
        format!("traefik.http.routers.{router}.tls.certresolver"),
        "default".to_string(),
    );
    labels.insert("hyac.container".to_string(), container_name.to_string());
    labels
}
