//! # replay-verify
//!
//! Distributed replay verification for a versioned transaction ledger.
//!
//! This crate splits a version interval into replay ranges and drives a fixed
//! pool of remote worker pods over them, providing:
//!
//! - **Range Splitting**: Contiguous chunks that never straddle a skip range
//! - **Bounded Dispatch**: At most `worker_cnt` live workers over a FIFO backlog
//! - **Outcome Policy**: Evictions retry, mismatches and hard failures are recorded
//! - **Run Telemetry**: Per-task attempt spans, retry counts, and metrics
//!
//! ## Core Concepts
//!
//! - **Range**: A half-open `[start, end)` span of versions replayed by one worker
//! - **Skip range**: An inclusive span of versions known to be unreplayable
//! - **Slot**: One of `worker_cnt` positions that hold at most one live worker
//! - **Run label**: Identifier attached to every pod and volume of a run
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use replay_verify::cluster::memory::InMemoryCluster;
//! use replay_verify::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let cluster = Arc::new(InMemoryCluster::new());
//! let config = ReplayConfig::for_network(Network::Testnet);
//! let options = SchedulerOptions::new(4, "rv-testnet-demo", "aptoslabs/tools:nightly");
//!
//! let mut scheduler = ReplayScheduler::new(
//!     config,
//!     options,
//!     VersionRange::new(0, 20_000_000)?,
//!     vec![SkipRange::new(4_000_000, 4_100_000)],
//!     cluster.clone(),
//!     cluster,
//! )?;
//! let report = scheduler.run(true).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod pod;
pub mod range;
pub mod scheduler;
pub mod skip;
pub mod stats;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cluster::{ClusterClient, PodSpec, PodStatus, VolumeHandle, VolumeProvisioner};
    pub use crate::config::{Network, ReplayConfig, SchedulerOptions};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::ReplayMetrics;
    pub use crate::pod::{Phase, ReplayExit, WorkerOutcome, WorkerPod};
    pub use crate::range::{SkipRange, SplitPlan, VersionRange};
    pub use crate::scheduler::{FailureLogs, FailureRecord, ReplayReport, ReplayScheduler};
    pub use crate::skip::SkipRangeFile;
    pub use crate::stats::{StatsSummary, TaskStats};
}
