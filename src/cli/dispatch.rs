use super::check::cmd_check;
use super::env::CliArgs;
use super::record::cmd_record;
use crate::cli::commands::Commands;
use crate::cli::context::CliContext;
use anyhow::Result;

pub async fn dispatch(cli: &CliArgs, ctx: &CliContext) -> Result<()> {
    match cli.command.clone() {
        Commands::Record(args) => cmd_record(args, ctx, cli.output).await,
        Commands::Check => cmd_check(ctx, cli.output).await,
    }
}
