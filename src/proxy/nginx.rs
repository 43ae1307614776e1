//! File-sink proxy adapter with the nginx verify-then-fallback reload
//! protocol carried forward from `original_source/server/core/nginx_config_generator.py`
//! (SPEC_FULL §10.5): test the new config, reload, verify the target domain
//! actually shows up in the live config dump, and fall back to a full
//! restart plus a second verification pass if the graceful reload didn't
//! take.

use std::path::PathBuf;

use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::db::Application;

use super::{ProxyError, ProxyResult, ProxySink};

pub struct NginxFileSink {
    /// Directory the proxy watches for per-app dynamic config files.
    dynamic_config_dir: PathBuf,
    /// Command used to test the new config, e.g. `nginx -t`.
    test_command: String,
    /// Command used to reload, e.g. `nginx -s reload`.
    reload_command: String,
    /// Command used to dump the live config for verification, e.g. `nginx -T`.
    dump_command: String,
    /// Command used to restart as a fallback, e.g. `systemctl restart nginx`.
    restart_command: String,
    /// Path prefix prepended to SPA-fallback static asset routes.
    static_prefix: String,
}

impl NginxFileSink {
    pub fn new(dynamic_config_dir: PathBuf, reload_command: Option<String>) -> Self {
        let reload_command = reload_command.unwrap_or_else(|| "nginx -s reload".to_string());
        Self {
            dynamic_config_dir,
            test_command: "nginx -t".to_string(),
            reload_command,
            dump_command: "nginx -T".to_string(),
            restart_command: "systemctl restart nginx".to_string(),
            static_prefix: "/static".to_string(),
        }
    }

    fn route_path(&self, app_id_lc: &str) -> PathBuf {
        self.dynamic_config_dir.join(format!("hyac-{app_id_lc}.conf"))
    }

    /// Atomic write-temp + rename, since the proxy watches this directory
    /// (§5 shared-resource policy: writes into a shared directory must be
    /// atomic if the consumer watches it).
    async fn write_atomic(&self, path: &PathBuf, contents: &str) -> ProxyResult<()> {
        let tmp_path = path.with_extension("conf.tmp");
        fs::write(&tmp_path, contents).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    fn render_config(
        &self,
        app: &Application,
        container_name: &str,
        runtime_port: u16,
        base_domain: &str,
    ) -> String {
        let host = format!("{}.{base_domain}", app.app_id_lc());
        format!(
            r#"# managed by hyac-control-plane, do not edit by hand
server {{
    listen 443 ssl;
    server_name {host};

    location {prefix}/ {{
        proxy_pass http://{container_name}:{port}/;
        proxy_intercept_errors on;
        error_page 404 = {prefix}/index.html;
        try_files $uri {prefix}/index.html;
    }}

    location / {{
        proxy_pass http://{container_name}:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
}}
"#,
            prefix = self.static_prefix,
            port = runtime_port,
        )
    }

    /// Three-phase verify-then-fallback reload: test, reload, verify the
    /// domain appears in the live dump; on failure, restart and verify once
    /// more.
    async fn reload_verified(&self, host: &str) -> ProxyResult<()> {
        let test = run(&self.test_command).await?;
        if !test.success {
            return Err(ProxyError::ReloadFailed(format!(
                "nginx -t failed: {}",
                test.output
            )));
        }

        let reload = run(&self.reload_command).await?;
        if reload.success && self.verify_live(host).await? {
            return Ok(());
        }

        warn!(host, "graceful reload did not take, falling back to restart");
        let restart = run(&self.restart_command).await?;
        if !restart.success {
            return Err(ProxyError::ReloadFailed(format!(
                "restart failed: {}",
                restart.output
            )));
        }
        if self.verify_live(host).await? {
            Ok(())
        } else {
            Err(ProxyError::VerificationFailed(host.to_string()))
        }
    }

    async fn verify_live(&self, host: &str) -> ProxyResult<bool> {
        let dump = run(&self.dump_command).await?;
        Ok(dump.output.contains(host))
    }
}

struct CommandOutput {
    success: bool,
    output: String,
}

async fn run(command_line: &str) -> ProxyResult<CommandOutput> {
    let parts = shell_words::split(command_line)
        .map_err(|e| ProxyError::ReloadFailed(format!("invalid command {command_line:?}: {e}")))?;
    let Some((program, args)) = parts.split_first() else {
        return Err(ProxyError::ReloadFailed(format!("empty command {command_line:?}")));
    };
    let output = Command::new(program).args(args).output().await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CommandOutput {
        success: output.status.success(),
        output: combined,
    })
}

#[async_trait::async_trait]
impl ProxySink for NginxFileSink {
    async fn write_route(
        &self,
        app: &Application,
        container_name: &str,
        runtime_port: u16,
        base_domain: &str,
    ) -> ProxyResult<()> {
        let host = format!("{}.{base_domain}", app.app_id_lc());
        let path = self.route_path(&app.app_id_lc());
        let config = self.render_config(app, container_name, runtime_port, base_domain);
        self.write_atomic(&path, &config).await?;
        self.reload_verified(&host).await?;
        info!(app_id = %app.app_id, host, "proxy route written and verified live");
        Ok(())
    }

    async fn remove_route(&self, app_id_lc: &str) -> ProxyResult<()> {
        let path = self.route_path(app_id_lc);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Best-effort reload; the route file is already gone either way.
        let _ = run(&self.reload_command).await;
        Ok(())
    }
}
