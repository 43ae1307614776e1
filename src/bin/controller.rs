//! Controller binary: the control plane process (§2).

use anyhow::Result;
use clap::Parser;
use tracing::error;

#[derive(Parser)]
#[command(name = "controller")]
#[command(about = "Hyac FaaS control plane")]
#[command(version)]
struct Cli {
    /// Path to the controller configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hyac_control_plane={log_level}").into()),
        )
        .init();

    if let Err(e) = hyac_control_plane::cmd::controller::run(&cli.config).await {
        error!(error = %e, "controller exited with error");
        std::process::exit(1);
    }

    Ok(())
}
