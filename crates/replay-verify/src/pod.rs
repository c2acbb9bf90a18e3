//! Worker pod lifecycle and outcome classification.
//!
//! A [`WorkerPod`] owns one remote replay job from launch to its terminal
//! phase:
//!
//! ```text
//! ┌─────────────┐  start()  ┌───────────────────┐  poll   ┌───────────┐
//! │ UNSCHEDULED │──────────►│ PENDING / RUNNING │────────►│ SUCCEEDED │
//! └─────────────┘           └───────────────────┘         └───────────┘
//!                                     │
//!                                     │ poll
//!                                     ▼
//!                               ┌──────────┐
//!                               │  FAILED  │── Evicted ──► range re-enqueued
//!                               └──────────┘── Mismatch ─► recorded, never retried
//!                                            ── Other ────► recorded, never retried
//! ```
//!
//! Terminal phases are sticky: once observed, the pod never polls again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{
    ClusterClient, EVICTED_REASON, PodSpec, PodStatus, RUN_LABEL_KEY, RemotePhase, VolumeHandle,
};
use crate::config::{ReplayConfig, SchedulerOptions};
use crate::error::{Error, Result};
use crate::range::VersionRange;

/// Exit-code contract of the replay binary.
///
/// All decoding of container exit codes happens here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayExit {
    /// Replay finished and every version verified.
    Success,
    /// Replay finished but recomputed state diverged from the recorded state.
    Mismatch,
    /// The replay process failed for any other reason.
    Failure(i32),
}

impl ReplayExit {
    /// Exit code the replay binary uses for a verification mismatch.
    pub const MISMATCH_EXIT_CODE: i32 = 2;

    /// Decodes a container exit code.
    #[must_use]
    pub const fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            Self::MISMATCH_EXIT_CODE => Self::Mismatch,
            other => Self::Failure(other),
        }
    }
}

/// Why a pod failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The cluster evicted the pod for resource reasons.
    Evicted,
    /// Any other failure; carries the cluster's reason text, if any.
    Other(String),
}

impl FailureReason {
    fn from_status(reason: Option<&str>) -> Self {
        match reason {
            Some(EVICTED_REASON) => Self::Evicted,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other("Error".to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evicted => f.write_str(EVICTED_REASON),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Lifecycle phase of a worker pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Not yet created on the cluster.
    Unscheduled,
    /// Created, containers not running yet.
    Pending,
    /// Replay in progress.
    Running,
    /// Replay finished successfully.
    Succeeded,
    /// The pod failed.
    Failed {
        /// Failure reason.
        reason: FailureReason,
        /// Exit code of the replay container, if it terminated.
        exit_code: Option<i32>,
    },
}

impl Phase {
    /// Returns true if this is a terminal phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Unscheduled => "unscheduled",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    fn from_status(status: &PodStatus) -> Self {
        match status.phase {
            RemotePhase::Pending => Self::Pending,
            // An unknown phase is not terminal; keep polling.
            RemotePhase::Running | RemotePhase::Unknown => Self::Running,
            RemotePhase::Succeeded => Self::Succeeded,
            RemotePhase::Failed => Self::Failed {
                reason: FailureReason::from_status(status.reason.as_deref()),
                exit_code: status.exit_code,
            },
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed {
                reason,
                exit_code: Some(code),
            } => write!(f, "failed ({reason}, exit code {code})"),
            Self::Failed {
                reason,
                exit_code: None,
            } => write!(f, "failed ({reason})"),
            other => f.write_str(other.as_label()),
        }
    }
}

/// Classified result of a finished worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// The range replayed and verified.
    Succeeded,
    /// The cluster evicted the worker; the range should be replayed again.
    Evicted,
    /// Replay diverged from recorded state; deterministic, never retried.
    Mismatch,
    /// Any other failure; recorded and not retried.
    Failed {
        /// Container exit code, if the container terminated.
        exit_code: Option<i32>,
        /// Failure reason reported by the cluster.
        reason: String,
    },
}

impl WorkerOutcome {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Evicted => "evicted",
            Self::Mismatch => "mismatch",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Launch parameters shared by every worker pod of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTemplate {
    /// Namespace pods are created in.
    pub namespace: String,
    /// Run label, also the pod name prefix.
    pub label: String,
    /// Container image.
    pub image: String,
    /// Replay binary inside the image.
    pub replay_binary: String,
    /// Mount path of the archival snapshot.
    pub target_db_dir: String,
    /// `--replay-concurrency-level`.
    pub replay_concurrency_level: u32,
    /// `--timeout-secs`.
    pub timeout_secs: u64,
    /// `--block-cache-size`.
    pub block_cache_size: u64,
    /// Adds `--enable-storage-sharding`.
    pub enable_storage_sharding: bool,
    /// Pod creation attempts.
    pub launch_attempts: u32,
    /// Sleep between creation attempts.
    pub launch_retry_delay: Duration,
}

impl PodTemplate {
    /// Builds the template from the network config and run options.
    #[must_use]
    pub fn new(config: &ReplayConfig, options: &SchedulerOptions) -> Self {
        Self {
            namespace: options.namespace.clone(),
            label: options.label.clone(),
            image: options.image.clone(),
            replay_binary: options.replay_binary.clone(),
            target_db_dir: options.target_db_dir.clone(),
            replay_concurrency_level: config.replay_concurrency_level,
            timeout_secs: config.timeout_secs,
            block_cache_size: config.block_cache_size,
            enable_storage_sharding: config.enable_storage_sharding,
            launch_attempts: options.launch_attempts,
            launch_retry_delay: options.launch_retry_delay,
        }
    }

    /// Pod name for one dispatch of a range.
    ///
    /// The first dispatch is `{label}-{start}-{end}`; the `n`th retry of an
    /// evicted range appends `-retry-{n}`. Every dispatch gets a name no
    /// earlier pod of the run has used, so a predecessor that is still
    /// terminating never blocks its replacement.
    #[must_use]
    pub fn pod_name(&self, range: VersionRange, retry: u32) -> String {
        match retry {
            0 => format!("{}-{}-{}", self.label, range.start(), range.end()),
            n => format!("{}-{}-{}-retry-{n}", self.label, range.start(), range.end()),
        }
    }

    /// Replay command line for a range.
    #[must_use]
    pub fn command(&self, range: VersionRange) -> Vec<String> {
        let mut command = vec![
            self.replay_binary.clone(),
            "aptos-db".to_string(),
            "replay-on-archive".to_string(),
            "--start-version".to_string(),
            range.start().to_string(),
            "--end-version".to_string(),
            range.end().to_string(),
            "--target-db-dir".to_string(),
            self.target_db_dir.clone(),
            "--concurrent-replay".to_string(),
            "--replay-concurrency-level".to_string(),
            self.replay_concurrency_level.to_string(),
            "--timeout-secs".to_string(),
            self.timeout_secs.to_string(),
            "--block-cache-size".to_string(),
            self.block_cache_size.to_string(),
        ];
        if self.enable_storage_sharding {
            command.push("--enable-storage-sharding".to_string());
        }
        command
    }

    /// Full launch spec for one pod.
    #[must_use]
    pub fn pod_spec(&self, name: &str, range: VersionRange, volume: &VolumeHandle) -> PodSpec {
        PodSpec {
            name: name.to_string(),
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            labels: [(RUN_LABEL_KEY.to_string(), self.label.clone())]
                .into_iter()
                .collect(),
            command: self.command(range),
            volume: volume.clone(),
            mount_path: self.target_db_dir.clone(),
        }
    }
}

/// One in-flight remote replay job.
pub struct WorkerPod {
    id: usize,
    name: String,
    range: VersionRange,
    retry: u32,
    volume: VolumeHandle,
    phase: Phase,
    created_at: Option<DateTime<Utc>>,
    template: Arc<PodTemplate>,
    cluster: Arc<dyn ClusterClient>,
}

// Manual Debug implementation since ClusterClient doesn't implement Debug
impl fmt::Debug for WorkerPod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPod")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("range", &self.range)
            .field("retry", &self.retry)
            .field("volume", &self.volume)
            .field("phase", &self.phase)
            .field("created_at", &self.created_at)
            .field("cluster", &"<ClusterClient>")
            .finish_non_exhaustive()
    }
}

impl WorkerPod {
    /// Creates an unscheduled worker bound to slot `id`.
    ///
    /// `retry` is the number of times `range` was evicted before this
    /// dispatch; it selects the pod name.
    #[must_use]
    pub fn new(
        id: usize,
        range: VersionRange,
        retry: u32,
        volume: VolumeHandle,
        template: Arc<PodTemplate>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            id,
            name: template.pod_name(range, retry),
            range,
            retry,
            volume,
            phase: Phase::Unscheduled,
            created_at: None,
            template,
            cluster,
        }
    }

    /// Slot index the worker occupies.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Unique pod name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Range the worker replays.
    #[must_use]
    pub const fn range(&self) -> VersionRange {
        self.range
    }

    /// Number of evictions of the range before this dispatch.
    #[must_use]
    pub const fn retry(&self) -> u32 {
        self.retry
    }

    /// Volume mounted by the worker.
    #[must_use]
    pub const fn volume(&self) -> &VolumeHandle {
        &self.volume
    }

    /// Last observed phase, without polling.
    #[must_use]
    pub const fn phase(&self) -> &Phase {
        &self.phase
    }

    /// When the pod was created on the cluster.
    #[must_use]
    pub const fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Creates the pod on the cluster, retrying with a fixed delay.
    ///
    /// Returns the number of attempts it took.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LaunchFailed`] once every attempt has been rejected.
    pub async fn start(&mut self) -> Result<u32> {
        let spec = self.template.pod_spec(&self.name, self.range, &self.volume);
        let attempts = self.template.launch_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.cluster.create_pod(&spec).await {
                Ok(()) => {
                    let created_at = Utc::now();
                    self.phase = Phase::Pending;
                    self.created_at = Some(created_at);
                    tracing::info!(
                        pod = %self.name,
                        slot = self.id,
                        range = %self.range,
                        volume = %self.volume,
                        created_at = %created_at.to_rfc3339(),
                        attempt,
                        "worker pod created"
                    );
                    return Ok(attempt);
                }
                Err(err) => {
                    tracing::warn!(
                        pod = %self.name,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "worker pod creation failed"
                    );
                    last_error = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.template.launch_retry_delay).await;
                    }
                }
            }
        }

        Err(Error::LaunchFailed {
            pod: self.name.clone(),
            range: self.range,
            attempts,
            message: last_error,
        })
    }

    /// Polls the cluster for the current phase.
    ///
    /// Terminal phases are never re-fetched. A failed poll leaves the phase
    /// unchanged.
    pub async fn get_phase(&mut self) -> &Phase {
        if self.phase.is_terminal() || self.phase == Phase::Unscheduled {
            return &self.phase;
        }

        match self
            .cluster
            .pod_status(&self.template.namespace, &self.name)
            .await
        {
            Ok(status) => {
                let phase = Phase::from_status(&status);
                if phase != self.phase {
                    tracing::debug!(
                        pod = %self.name,
                        from = self.phase.as_label(),
                        to = phase.as_label(),
                        "worker pod phase changed"
                    );
                }
                self.phase = phase;
            }
            Err(err) => {
                tracing::warn!(pod = %self.name, error = %err, "worker pod status poll failed");
            }
        }
        &self.phase
    }

    /// Polls and returns true once the pod reached a terminal phase.
    pub async fn is_completed(&mut self) -> bool {
        self.get_phase().await.is_terminal()
    }

    /// Returns true if the pod failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.phase, Phase::Failed { .. })
    }

    /// Returns true if the pod failed because the cluster evicted it.
    #[must_use]
    pub const fn should_reschedule(&self) -> bool {
        matches!(
            self.phase,
            Phase::Failed {
                reason: FailureReason::Evicted,
                ..
            }
        )
    }

    /// Returns true if the replay finished with a verification mismatch.
    #[must_use]
    pub fn has_txn_mismatch(&self) -> bool {
        matches!(
            self.phase,
            Phase::Failed {
                exit_code: Some(code),
                ..
            } if ReplayExit::from_exit_code(code) == ReplayExit::Mismatch
        )
    }

    /// Classifies a terminal pod; `None` while the pod is still live.
    ///
    /// A mismatch wins over every other classification.
    #[must_use]
    pub fn outcome(&self) -> Option<WorkerOutcome> {
        match &self.phase {
            Phase::Unscheduled | Phase::Pending | Phase::Running => None,
            _ if self.has_txn_mismatch() => Some(WorkerOutcome::Mismatch),
            Phase::Succeeded => Some(WorkerOutcome::Succeeded),
            Phase::Failed {
                reason: FailureReason::Evicted,
                ..
            } => Some(WorkerOutcome::Evicted),
            Phase::Failed { reason, exit_code } => Some(WorkerOutcome::Failed {
                exit_code: *exit_code,
                reason: reason.to_string(),
            }),
        }
    }

    /// Deletes the pod from the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the delete.
    pub async fn delete_pod(&self) -> Result<()> {
        self.cluster
            .delete_pod(&self.template.namespace, &self.name)
            .await?;
        tracing::info!(pod = %self.name, "worker pod deleted");
        Ok(())
    }
}
