//! CLI command implementations.

pub mod cleanup;
pub mod plan;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use replay_verify::config::ReplayConfig;
use replay_verify::range::{SkipRange, VersionRange};
use replay_verify::skip::SkipRangeFile;

/// Interval selection shared by `run` and `plan`.
#[derive(Debug, Clone, Args)]
pub struct IntervalArgs {
    /// First version to replay (defaults to the skip file's start).
    #[arg(long)]
    pub start: Option<u64>,

    /// End of the interval, exclusive (defaults to the skip file's end).
    #[arg(long)]
    pub end: Option<u64>,

    /// JSON document with the known-good interval and skip ranges.
    #[arg(long, env = "REPLAY_VERIFY_SKIP_FILE")]
    pub skip_file: Option<PathBuf>,

    /// Target number of versions per range (network default if unset).
    #[arg(long)]
    pub range_size: Option<u64>,

    /// Ranges shorter than this are not scheduled (network default if unset).
    #[arg(long)]
    pub min_range_size: Option<u64>,
}

/// Interval and skip list a run covers.
#[derive(Debug, Clone)]
pub struct ResolvedInterval {
    /// Interval to split.
    pub interval: VersionRange,
    /// Skip ranges to honor.
    pub skip_ranges: Vec<SkipRange>,
}

impl IntervalArgs {
    /// Applies range size overrides on top of the network defaults.
    #[must_use]
    pub fn apply(&self, mut config: ReplayConfig) -> ReplayConfig {
        if let Some(range_size) = self.range_size {
            config = config.with_range_size(range_size);
        }
        if let Some(min_range_size) = self.min_range_size {
            config = config.with_min_range_size(min_range_size);
        }
        config
    }

    /// Resolves the interval from the skip file and overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the skip file cannot be read, an override falls
    /// outside its interval, or no interval can be determined.
    pub fn resolve(&self) -> Result<ResolvedInterval> {
        let (start, end, skip_ranges) = match &self.skip_file {
            Some(path) => {
                let file = SkipRangeFile::from_path(path)
                    .with_context(|| format!("failed to load skip file {}", path.display()))?;
                let (start, end) = file
                    .resolve_interval(self.start, self.end)
                    .context("invalid --start/--end override")?;
                (start, end, file.skip_ranges)
            }
            None => {
                let start = self
                    .start
                    .context("--start is required without --skip-file")?;
                let end = self.end.context("--end is required without --skip-file")?;
                (start, end, Vec::new())
            }
        };

        let interval = VersionRange::new(start, end).context("invalid replay interval")?;
        Ok(ResolvedInterval {
            interval,
            skip_ranges,
        })
    }
}
