//! Configuration structures and loading

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level controller/runtime configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode (raises the default log filter, includes stack
    /// traces in error envelopes).
    #[serde(default)]
    pub debug: bool,

    /// Management HTTP API configuration.
    pub api: ApiConfiguration,

    /// System paths and settings.
    pub system: SystemConfiguration,

    /// Container engine configuration.
    pub docker: DockerConfiguration,

    /// Document-store configuration (sqlite standing in for the excluded
    /// document database collaborator).
    #[serde(default)]
    pub document_store: DocumentStoreConfiguration,

    /// Blob-store (object storage) configuration.
    pub blob: BlobConfiguration,

    /// Reverse-proxy sink configuration.
    #[serde(default)]
    pub proxy: ProxyConfiguration,

    /// Management API authentication.
    pub auth: AuthConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file, resolving relative paths against
    /// the file's parent directory, exactly as the original loader does.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.system.resolve_paths(&base_dir);
        config.document_store.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.system.data_directory)?;
        std::fs::create_dir_all(&config.system.log_directory)?;
        std::fs::create_dir_all(&config.system.tmp_directory)?;
        if let Some(parent) = config.document_store.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(dir) = &config.proxy.dynamic_config_dir {
            std::fs::create_dir_all(dir)?;
        }

        Ok(config)
    }
}

/// Management HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: SslConfiguration,

    /// Base domain that app subdomains are routed under
    /// (`<app_id_lc>.<base_domain>`).
    pub base_domain: String,
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

/// TLS configuration for the management API, delegated to the proxy's cert
/// resolver in production; only used for standalone/dev binds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfiguration {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cert: String,

    #[serde(default)]
    pub key: String,
}

/// System paths and settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    #[serde(default = "default_tmp_directory")]
    pub tmp_directory: PathBuf,

    /// Optional mount path for dev-mode bind-mounted function source.
    #[serde(default)]
    pub dev_source_path: Option<PathBuf>,

    /// Dev mode: bind-mounts `dev_source_path` into runtime containers.
    #[serde(default)]
    pub dev_mode: bool,
}

impl SystemConfiguration {
    pub fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        self.data_directory = Self::resolve_path(&self.data_directory, base_dir);
        self.log_directory = Self::resolve_path(&self.log_directory, base_dir);
        self.tmp_directory = Self::resolve_path(&self.tmp_directory, base_dir);
        if let Some(p) = &self.dev_source_path {
            self.dev_source_path = Some(Self::resolve_path(p, base_dir));
        }
    }

    fn resolve_path(path: &std::path::Path, base_dir: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            let resolved = base_dir.join(path);
            resolved
                .canonicalize()
                .unwrap_or_else(|_| Self::normalize_path(&resolved))
        }
    }

    fn normalize_path(path: &std::path::Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    components.pop();
                }
                std::path::Component::CurDir => {}
                c => components.push(c),
            }
        }
        components.iter().collect()
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from(".hyac/data")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(".hyac/logs")
}

fn default_tmp_directory() -> PathBuf {
    PathBuf::from(".hyac/tmp")
}

/// Container engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    /// Network name new app containers are attached to. Overridden at
    /// runtime by inspecting the controller's own container when possible
    /// (§4.2 step 4); this is the documented fallback.
    #[serde(default = "default_network_name")]
    pub network: String,

    /// Image reference for the per-app runtime container.
    #[serde(default = "default_runtime_image")]
    pub runtime_image: String,

    /// Fixed port the runtime process listens on inside its container.
    #[serde(default = "default_runtime_port")]
    pub runtime_port: u16,

    /// Default memory overhead (MB) applied on top of a function's declared
    /// `memory_limit`, mirroring the teacher's overhead configuration.
    #[serde(default)]
    pub memory_overhead_mb: u64,

    /// If the runtime image is missing locally, build it from this
    /// Dockerfile directory instead of only pulling (SPEC_FULL §10.5).
    #[serde(default)]
    pub build_image_if_missing: Option<PathBuf>,

    /// Readiness poll: attempts x interval (seconds). Reference: 30 x 2s.
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
    #[serde(default = "default_readiness_interval_secs")]
    pub readiness_interval_secs: u64,

    /// DNS wait: attempts x interval (seconds). Reference: 15 x 1s.
    #[serde(default = "default_dns_attempts")]
    pub dns_attempts: u32,
    #[serde(default = "default_dns_interval_secs")]
    pub dns_interval_secs: u64,
}

fn default_docker_socket() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let user_socket = std::path::Path::new(&home).join(".colima/default/docker.sock");
            if user_socket.exists() {
                return format!("unix://{}", user_socket.display());
            }
            let docker_desktop = std::path::Path::new(&home).join(".docker/run/docker.sock");
            if docker_desktop.exists() {
                return format!("unix://{}", docker_desktop.display());
            }
        }
        "/var/run/docker.sock".into()
    }
}

fn default_network_name() -> String {
    "bridge".into()
}

fn default_runtime_image() -> String {
    "hyac/runtime:latest".into()
}

fn default_runtime_port() -> u16 {
    8001
}

fn default_readiness_attempts() -> u32 {
    30
}

fn default_readiness_interval_secs() -> u64 {
    2
}

fn default_dns_attempts() -> u32 {
    15
}

fn default_dns_interval_secs() -> u64 {
    1
}

/// Document-store configuration (sqlite, WAL).
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentStoreConfiguration {
    #[serde(default = "default_document_store_path")]
    pub path: PathBuf,
}

impl DocumentStoreConfiguration {
    fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        self.path = SystemConfiguration::resolve_path(&self.path, base_dir);
    }
}

impl Default for DocumentStoreConfiguration {
    fn default() -> Self {
        Self {
            path: default_document_store_path(),
        }
    }
}

fn default_document_store_path() -> PathBuf {
    PathBuf::from(".hyac/data/hyac.sqlite3")
}

/// Blob-store configuration, reusing the teacher's S3-adapter config shape.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfiguration {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,

    #[serde(default = "default_blob_region")]
    pub region: String,

    #[serde(default = "default_true")]
    pub use_path_style: bool,
}

fn default_blob_region() -> String {
    "us-east-1".into()
}

fn default_true() -> bool {
    true
}

/// Reverse-proxy sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfiguration {
    /// Shared directory the proxy watches for per-app dynamic config files.
    #[serde(default)]
    pub dynamic_config_dir: Option<PathBuf>,

    /// Command used to test + reload the proxy (e.g. `nginx -s reload`).
    /// Only consulted when `dynamic_config_dir` is set, i.e. a file-sink
    /// proxy integration is in use.
    #[serde(default)]
    pub reload_command: Option<String>,

    /// Subdomain prefix the static-hosting ("web") route is served under,
    /// e.g. apps reachable at `<app_id_lc>.<base_domain>` also serve their
    /// web bucket there; this names the separate static-hosting vhost used
    /// when the app and web routes are split across cert resolvers.
    #[serde(default)]
    pub web_subdomain_suffix: Option<String>,
}

/// Management API authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfiguration {
    /// Static bearer credential. Accepts either a bare `SECRET_KEY` or a
    /// `token_id.token` pair, matching §6.
    pub secret_key: String,

    /// Signing secret for the short-lived WebSocket log-stream JWTs.
    pub jwt_secret: String,

    /// WS token lifetime in seconds.
    #[serde(default = "default_ws_token_ttl")]
    pub ws_token_ttl_secs: u64,
}

fn default_ws_token_ttl() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_dot_without_requiring_existence() {
        let base = std::path::Path::new("/opt/hyac");
        let resolved =
            SystemConfiguration::resolve_path(std::path::Path::new("../var/nope"), base);
        assert_eq!(resolved, std::path::PathBuf::from("/opt/var/nope"));
    }

    #[test]
    fn absolute_paths_pass_through() {
        let base = std::path::Path::new("/opt/hyac");
        let resolved = SystemConfiguration::resolve_path(std::path::Path::new("/etc/hyac"), base);
        assert_eq!(resolved, std::path::PathBuf::from("/etc/hyac"));
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            [api]
            base_domain = "apps.example.com"

            [docker]

            [blob]
            endpoint = "http://minio:9000"
            access_key = "key"
            secret_key = "secret"

            [auth]
            secret_key = "shh"
            jwt_secret = "also-shh"
        "#;
        let config: Configuration = toml::from_str(toml).unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.docker.runtime_port, 8001);
        assert!(config.proxy.dynamic_config_dir.is_none());
    }
}
