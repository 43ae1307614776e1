//! Runtime binary: one process per application, the data plane (§2, §4.6).
//! Configured entirely through the environment the orchestrator injects
//! into the container (`APP_ID`, bucket names, blob credentials, the
//! shared document-store path) rather than a config file, since each
//! instance is disposable and created fresh per app start.

use anyhow::Result;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    let debug = std::env::var("HYAC_DEBUG").is_ok();
    let log_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hyac_control_plane={log_level}").into()),
        )
        .init();

    if let Err(e) = hyac_control_plane::cmd::runtime::run().await {
        error!(error = %e, "runtime exited with error");
        std::process::exit(1);
    }

    Ok(())
}
