//! Cleanup command - delete resources left by a run label.

use anyhow::{Context, Result};
use clap::Args;
use replay_verify::config::validate_label;

use crate::{Config, OutputFormat, cluster};

/// Arguments for the cleanup command.
#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Run label whose pods and volumes are deleted.
    #[arg(long)]
    pub label: String,
}

/// Execute the cleanup command.
///
/// # Errors
///
/// Returns an error if the label is malformed, the cluster cannot be
/// reached, or a delete fails.
pub async fn execute(args: CleanupArgs, config: &Config) -> Result<()> {
    validate_label(&args.label).context("invalid run label")?;
    let handles = cluster::connect(config, false)?;

    let pods = handles
        .cluster
        .delete_pods_by_label(&config.namespace, &args.label)
        .await
        .with_context(|| format!("failed to delete pods labelled {}", args.label))?;
    let volumes = handles
        .cluster
        .delete_volumes_by_label(&config.namespace, &args.label)
        .await
        .with_context(|| format!("failed to delete volumes labelled {}", args.label))?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "label": args.label,
                    "namespace": config.namespace,
                    "podsDeleted": pods,
                    "volumesDeleted": volumes,
                }))?
            );
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!(
                "Deleted {pods} pods and {volumes} volumes labelled {} in {}",
                args.label, config.namespace
            );
        }
    }
    Ok(())
}
