//! Run command - replay an interval on the cluster and verify it.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use replay_verify::config::{
    Network, ReplayConfig, SchedulerOptions, generate_label, image_for_tag,
};
use replay_verify::scheduler::ReplayScheduler;

use super::IntervalArgs;
use crate::{Config, cluster, output};

/// Image tag used when no real image is launched.
const DRY_RUN_TAG: &str = "dry-run";

/// Exit code for an interrupted run.
const INTERRUPTED_EXIT_CODE: u8 = 130;

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Network to replay.
    #[arg(long, env = "REPLAY_VERIFY_NETWORK")]
    pub network: Network,

    /// Interval selection.
    #[command(flatten)]
    pub interval: IntervalArgs,

    /// Number of concurrent worker pods (network default if unset).
    #[arg(long)]
    pub worker_cnt: Option<usize>,

    /// Tag of the replay tools image.
    #[arg(long, env = "REPLAY_VERIFY_IMAGE_TAG", required_unless_present = "dry_run")]
    pub image_tag: Option<String>,

    /// Run label (generated if unset).
    #[arg(long)]
    pub label: Option<String>,

    /// Delete leftovers of a previous run with the same label first.
    #[arg(long)]
    pub from_scratch: bool,

    /// Run against an in-memory cluster where every range succeeds.
    #[arg(long)]
    pub dry_run: bool,

    /// Seconds between scans over the worker slots.
    #[arg(long, default_value = "10")]
    pub poll_interval: u64,

    /// Seconds `--from-scratch` waits for the previous run's resources to go away.
    #[arg(long, default_value = "300")]
    pub teardown_timeout: u64,
}

/// Execute the run command.
///
/// Exits with code 1 if any range produced a mismatch, and 130 if
/// interrupted (after cleaning up the run's pods and volumes).
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the cluster cannot be
/// reached, or the run aborts.
pub async fn execute(args: RunArgs, config: &Config) -> Result<ExitCode> {
    let replay_config = args.interval.apply(ReplayConfig::for_network(args.network));
    let resolved = args.interval.resolve()?;

    let worker_cnt = args.worker_cnt.unwrap_or(replay_config.default_worker_cnt);
    let label = args
        .label
        .clone()
        .unwrap_or_else(|| generate_label(args.network));
    let image = image_for_tag(args.image_tag.as_deref().unwrap_or(DRY_RUN_TAG));
    let options = SchedulerOptions::new(worker_cnt, &label, image)
        .with_namespace(&config.namespace)
        .with_poll_interval(Duration::from_secs(args.poll_interval))
        .with_teardown_timeout(Duration::from_secs(args.teardown_timeout));

    let handles = cluster::connect(config, args.dry_run)?;
    let mut scheduler = ReplayScheduler::new(
        replay_config,
        options,
        resolved.interval,
        resolved.skip_ranges,
        handles.cluster,
        handles.provisioner,
    )
    .context("invalid replay configuration")?;

    tracing::info!(
        label = %label,
        network = %args.network,
        interval = %resolved.interval,
        worker_cnt,
        "starting replay run"
    );

    let finished = tokio::select! {
        result = scheduler.run(args.from_scratch) => Some(result),
        () = interrupted() => None,
    };

    let Some(result) = finished else {
        tracing::warn!(label = %label, "interrupted, cleaning up run resources");
        scheduler
            .cleanup()
            .await
            .context("cleanup after interrupt failed")?;
        return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE));
    };

    let report = result.with_context(|| format!("replay run {label} failed"))?;
    output::print_report(&report, &config.format)?;

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}
