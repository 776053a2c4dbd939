use anyhow::Context;
use clap::Parser;
use tracing::info;

use ringwire::bootstrap::{init_tracing, shutdown_signal};
use ringwire::collab::Ringwire;
use ringwire::collab::config::{LOG_ENV_VAR, Settings};

#[derive(Debug, Parser)]
#[command(name = "ringwire-server", about = "Draft ring mutation API and push gateway")]
struct Cli {
    /// YAML settings file, layered over ringwire.yaml
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LOG_ENV_VAR);
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    info!(?settings, "settings loaded");

    let server = Ringwire::new(settings)
        .start()
        .await
        .context("failed to bind listeners")?;
    info!(
        push = %server.push_addr(),
        api = %server.api_addr(),
        "ringwire ready"
    );

    shutdown_signal().await;
    server.shutdown().await;
    Ok(())
}
