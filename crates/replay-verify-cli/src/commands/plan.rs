//! Plan command - print the ranges a run would dispatch.

use anyhow::{Context, Result};
use clap::Args;

use replay_verify::config::{Network, ReplayConfig};
use replay_verify::range;

use super::IntervalArgs;
use crate::{Config, output};

/// Arguments for the plan command.
#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Network to plan for.
    #[arg(long, env = "REPLAY_VERIFY_NETWORK")]
    pub network: Network,

    /// Interval selection.
    #[command(flatten)]
    pub interval: IntervalArgs,
}

/// Execute the plan command.
///
/// # Errors
///
/// Returns an error if the interval or configuration is invalid.
pub fn execute(args: &PlanArgs, config: &Config) -> Result<()> {
    let replay_config = args.interval.apply(ReplayConfig::for_network(args.network));
    replay_config.validate().context("invalid replay configuration")?;
    let resolved = args.interval.resolve()?;

    let plan = range::plan(
        resolved.interval.start(),
        resolved.interval.end(),
        &resolved.skip_ranges,
        replay_config.range_size,
        replay_config.min_range_size,
    );
    output::print_plan(&plan, &config.format)
}
