use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

use super::context::CliContext;
use super::dispatch::dispatch;
use super::env::CliArgs;
use super::runtime::load_local_env_overrides;
use framecast::{init_logging, load_config, LoadedConfig};

pub async fn run() -> Result<()> {
    let cli = CliArgs::parse();

    init_logging(&cli.log_level, cli.debug, cli.log_format)?;
    load_local_env_overrides();

    info!(target: "framecast", "Starting Framecast v{}", env!("CARGO_PKG_VERSION"));

    let LoadedConfig { config, path } = load_config(cli.config.as_deref()).await?;
    let cli_context = CliContext::new(config, path);
    debug!(target: "framecast", config = %cli_context.config_path().display(), "configuration resolved");

    match dispatch(&cli, &cli_context).await {
        Ok(()) => {
            info!(target: "framecast", "Command completed successfully");
            Ok(())
        }
        Err(err) => {
            error!(target: "framecast", "Command failed: {:#}", err);
            Err(err)
        }
    }
}
