//! Replay verification CLI.
//!
//! The main entry point for the `replay-verify` binary.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use replay_verify::observability::init_logging;
use replay_verify_cli::{Cli, Commands};

fn main() -> Result<ExitCode> {
    // Parse CLI arguments
    let cli = Cli::parse();
    init_logging(cli.log_format.into());
    let config = cli.config();

    // Create runtime and execute
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => replay_verify_cli::commands::run::execute(args, &config).await,
            Commands::Plan(args) => {
                replay_verify_cli::commands::plan::execute(&args, &config).map(|()| ExitCode::SUCCESS)
            }
            Commands::Cleanup(args) => replay_verify_cli::commands::cleanup::execute(args, &config)
                .await
                .map(|()| ExitCode::SUCCESS),
        }
    })
}
