//! Replay scheduling over a fixed pool of worker slots.
//!
//! The scheduler executes a replay run with:
//!
//! - **Bounded concurrency**: at most `worker_cnt` worker pods are live
//! - **FIFO backlog**: planned ranges run in order; evicted ranges go to the tail
//! - **Outcome policy**: evictions retry, mismatches and other failures are recorded
//! - **Guaranteed teardown**: [`ReplayScheduler::run`] cleans up on every path
//!
//! The loop is a single cooperative poller: all parallel work happens
//! remotely, and the scheduler only sleeps between scans.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;

use crate::cluster::{ClusterClient, VolumeHandle, VolumeProvisioner, VolumeRequest};
use crate::config::{ReplayConfig, SchedulerOptions};
use crate::error::{Error, Result};
use crate::metrics::{ReplayMetrics, time_scan};
use crate::observability::run_span;
use crate::pod::{PodTemplate, ReplayExit, WorkerOutcome, WorkerPod};
use crate::range::{self, SkipRange, VersionRange};
use crate::stats::{StatsSummary, TaskStats};

/// A range whose worker ended in a mismatch or a hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Worker pod name.
    pub pod: String,
    /// Range the worker replayed.
    pub range: VersionRange,
    /// Container exit code, if the container terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure reason.
    pub reason: String,
}

/// Failure logs accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureLogs {
    /// Ranges whose replay diverged from recorded state.
    pub mismatches: Vec<FailureRecord>,
    /// Ranges whose worker failed for a non-retryable, non-mismatch reason.
    pub failures: Vec<FailureRecord>,
}

/// Final result of a replay run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    /// Run label.
    pub label: String,
    /// Replayed network.
    pub network: String,
    /// Interval that was split into tasks.
    pub interval: VersionRange,
    /// Number of ranges planned by the splitter.
    pub tasks_planned: usize,
    /// Mismatch log.
    pub mismatches: Vec<FailureRecord>,
    /// Hard-failure log.
    pub failures: Vec<FailureRecord>,
    /// Ranges never scheduled because they were below the minimum chunk size.
    pub unverified: Vec<VersionRange>,
    /// Per-task telemetry, ordered by pod name.
    pub stats: Vec<TaskStats>,
    /// Aggregate telemetry.
    pub summary: StatsSummary,
}

impl ReplayReport {
    /// Returns true when no range produced a mismatch.
    ///
    /// Hard failures are reported but do not fail the run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Drives worker pods over the backlog of version ranges.
pub struct ReplayScheduler {
    config: ReplayConfig,
    options: SchedulerOptions,
    template: Arc<PodTemplate>,
    interval: VersionRange,
    skip_ranges: Vec<SkipRange>,
    cluster: Arc<dyn ClusterClient>,
    provisioner: Arc<dyn VolumeProvisioner>,
    volumes: Vec<VolumeHandle>,
    workers: Vec<Option<WorkerPod>>,
    backlog: VecDeque<VersionRange>,
    evictions: BTreeMap<VersionRange, u32>,
    task_stats: BTreeMap<String, TaskStats>,
    logs: FailureLogs,
    unverified: Vec<VersionRange>,
    tasks_planned: usize,
    metrics: ReplayMetrics,
}

// Manual Debug implementation since the cluster traits don't implement Debug
impl std::fmt::Debug for ReplayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayScheduler")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("interval", &self.interval)
            .field("volumes", &self.volumes)
            .field("active_workers", &self.active_workers())
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

impl ReplayScheduler {
    /// Creates a scheduler for `interval`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the network config or run options
    /// are invalid.
    pub fn new(
        config: ReplayConfig,
        options: SchedulerOptions,
        interval: VersionRange,
        skip_ranges: Vec<SkipRange>,
        cluster: Arc<dyn ClusterClient>,
        provisioner: Arc<dyn VolumeProvisioner>,
    ) -> Result<Self> {
        config.validate()?;
        options.validate()?;

        if options.worker_cnt > config.volume_pool_size {
            // Volumes are read-only snapshot clones; concurrent mounts are expected.
            tracing::warn!(
                worker_cnt = options.worker_cnt,
                volume_pool_size = config.volume_pool_size,
                workers_per_volume = options.worker_cnt.div_ceil(config.volume_pool_size),
                "worker pods will share snapshot volumes"
            );
        }

        let template = Arc::new(PodTemplate::new(&config, &options));
        let workers = (0..options.worker_cnt).map(|_| None).collect();

        Ok(Self {
            config,
            options,
            template,
            interval,
            skip_ranges,
            cluster,
            provisioner,
            volumes: Vec::new(),
            workers,
            backlog: VecDeque::new(),
            evictions: BTreeMap::new(),
            task_stats: BTreeMap::new(),
            logs: FailureLogs::default(),
            unverified: Vec::new(),
            tasks_planned: 0,
            metrics: ReplayMetrics::new(),
        })
    }

    /// Ranges waiting for a free slot, front first.
    #[must_use]
    pub const fn backlog(&self) -> &VecDeque<VersionRange> {
        &self.backlog
    }

    /// Number of times `range` has been evicted and re-enqueued.
    #[must_use]
    pub fn retry_count(&self, range: VersionRange) -> u32 {
        self.evictions.get(&range).copied().unwrap_or(0)
    }

    /// Per-task telemetry keyed by pod name.
    #[must_use]
    pub const fn task_stats(&self) -> &BTreeMap<String, TaskStats> {
        &self.task_stats
    }

    /// Failure logs accumulated so far.
    #[must_use]
    pub const fn failure_logs(&self) -> &FailureLogs {
        &self.logs
    }

    /// Ranges dropped by the splitter for being below the minimum size.
    #[must_use]
    pub fn unverified(&self) -> &[VersionRange] {
        &self.unverified
    }

    /// Provisioned volume handles.
    #[must_use]
    pub fn volumes(&self) -> &[VolumeHandle] {
        &self.volumes
    }

    /// Number of occupied worker slots.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|slot| slot.is_some()).count()
    }

    /// Splits the interval and fills the backlog.
    pub fn create_tasks(&mut self) {
        let plan = range::plan(
            self.interval.start(),
            self.interval.end(),
            &self.skip_ranges,
            self.config.range_size,
            self.config.min_range_size,
        );

        if !plan.dropped.is_empty() {
            tracing::warn!(
                ranges = plan.dropped.len(),
                versions = plan.dropped_versions(),
                min_range_size = self.config.min_range_size,
                "ranges below the minimum chunk size will not be verified"
            );
        }
        tracing::info!(
            tasks = plan.tasks.len(),
            versions = plan.scheduled_versions(),
            interval = %self.interval,
            skip_ranges = self.skip_ranges.len(),
            "created replay tasks"
        );

        self.metrics.set_unverified_versions(plan.dropped_versions());
        self.tasks_planned = plan.tasks.len();
        self.backlog = plan.tasks.into();
        self.unverified = plan.dropped;
        self.metrics.set_backlog_depth(self.backlog.len());
    }

    /// Clones the snapshot volume pool for the run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeCountMismatch`] unless exactly `volume_pool_size`
    /// handles come back, or any error from the provisioner.
    pub async fn provision_volumes(&mut self) -> Result<()> {
        let request = VolumeRequest {
            run_id: self.options.label.clone(),
            snapshot_name: self.config.snapshot_name.clone(),
            namespace: self.options.namespace.clone(),
            count: self.config.volume_pool_size,
            label: self.options.label.clone(),
        };
        let volumes = self.provisioner.create_volumes_from_snapshot(&request).await?;
        if volumes.len() != request.count {
            return Err(Error::VolumeCountMismatch {
                expected: request.count,
                actual: volumes.len(),
            });
        }
        tracing::info!(
            count = volumes.len(),
            snapshot = %request.snapshot_name,
            "provisioned snapshot volumes"
        );
        self.volumes = volumes;
        Ok(())
    }

    /// Dispatches the whole backlog.
    ///
    /// With `from_scratch`, leftovers of a prior run under the same label are
    /// deleted first, and scheduling waits until the cluster no longer lists
    /// any of them. Returns once the backlog is empty; workers may still be
    /// in flight (see [`ReplayScheduler::collect_all_failed_logs`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the reset or provisioning fails, leftovers outlive
    /// the teardown timeout, or a worker pod cannot be launched.
    pub async fn schedule(&mut self, from_scratch: bool) -> Result<()> {
        if from_scratch {
            self.cleanup().await?;
            self.await_teardown().await?;
        }
        if self.volumes.is_empty() {
            self.provision_volumes().await?;
        }
        self.create_tasks();

        while !self.backlog.is_empty() {
            self.scan_slots().await?;
            if self.backlog.is_empty() {
                break;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }

        tracing::info!(
            active_workers = self.active_workers(),
            "backlog dispatched"
        );
        Ok(())
    }

    /// Waits for every in-flight worker to finish and returns the failure logs.
    ///
    /// Ranges evicted during the drain are dispatched again, so no work is
    /// abandoned. On return every slot is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a re-dispatched worker cannot be launched.
    pub async fn collect_all_failed_logs(&mut self) -> Result<FailureLogs> {
        while self.active_workers() > 0 || !self.backlog.is_empty() {
            self.scan_slots().await?;
            if self.active_workers() == 0 && self.backlog.is_empty() {
                break;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
        Ok(self.logs.clone())
    }

    /// Deletes every pod and volume carrying the run label.
    ///
    /// Both deletes are attempted even if the first fails.
    ///
    /// # Errors
    ///
    /// Returns the first cluster error encountered.
    pub async fn cleanup(&mut self) -> Result<()> {
        let namespace = &self.options.namespace;
        let label = &self.options.label;

        let pods = self.cluster.delete_pods_by_label(namespace, label).await;
        let volumes = self.cluster.delete_volumes_by_label(namespace, label).await;

        self.workers.iter_mut().for_each(|slot| *slot = None);
        self.volumes.clear();
        self.metrics.set_active_workers(0);

        match (&pods, &volumes) {
            (Ok(pods), Ok(volumes)) => {
                tracing::info!(pods, volumes, label = %label, "cleaned up run resources");
            }
            _ => {
                tracing::error!(
                    pods = ?pods.as_ref().err().map(ToString::to_string),
                    volumes = ?volumes.as_ref().err().map(ToString::to_string),
                    label = %label,
                    "cleanup failed"
                );
            }
        }
        pods?;
        volumes?;
        Ok(())
    }

    /// Polls until no pod or volume carries the run label.
    ///
    /// Cluster deletes are asynchronous: names stay taken while objects
    /// terminate, so provisioning must not start before they are gone.
    async fn await_teardown(&self) -> Result<()> {
        let namespace = &self.options.namespace;
        let label = &self.options.label;
        let started = tokio::time::Instant::now();

        loop {
            let remaining = self.cluster.count_by_label(namespace, label).await?;
            if remaining == 0 {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.options.teardown_timeout {
                return Err(Error::TeardownTimeout {
                    label: label.clone(),
                    remaining,
                    waited,
                });
            }
            tracing::info!(
                remaining,
                label = %label,
                waited_secs = waited.as_secs(),
                "waiting for previous run resources to terminate"
            );
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Runs the whole replay: schedule, drain, and always clean up.
    ///
    /// # Errors
    ///
    /// Returns the scheduling error if one occurred (after cleanup ran), or
    /// the cleanup error otherwise.
    pub async fn run(&mut self, from_scratch: bool) -> Result<ReplayReport> {
        let span = run_span(
            &self.options.label,
            self.config.network.as_label(),
            &self.options.namespace,
        );
        async {
            let result = self.schedule_and_drain(from_scratch).await;
            let cleanup = self.cleanup().await;

            let logs = result?;
            cleanup?;

            let report = self.report(logs);
            tracing::info!(
                tasks = report.tasks_planned,
                mismatches = report.mismatches.len(),
                failures = report.failures.len(),
                unverified = report.unverified.len(),
                retries = report.summary.total_retries,
                success = report.is_success(),
                "replay run finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn schedule_and_drain(&mut self, from_scratch: bool) -> Result<FailureLogs> {
        self.schedule(from_scratch).await?;
        self.collect_all_failed_logs().await
    }

    /// One pass over every slot: reap finished workers, then refill from the
    /// backlog while it lasts.
    async fn scan_slots(&mut self) -> Result<()> {
        let _timer = time_scan();

        for slot in 0..self.workers.len() {
            if let Some(pod) = self.workers[slot].as_mut() {
                if !pod.is_completed().await {
                    continue;
                }
                if let Some(pod) = self.workers[slot].take() {
                    self.process_completed_pod(pod).await;
                }
            }

            if let Some(range) = self.backlog.pop_front() {
                self.dispatch(slot, range).await?;
            }
        }

        self.metrics.set_backlog_depth(self.backlog.len());
        self.metrics.set_active_workers(self.active_workers());
        Ok(())
    }

    async fn dispatch(&mut self, slot: usize, range: VersionRange) -> Result<()> {
        if self.volumes.is_empty() {
            self.backlog.push_front(range);
            return Err(Error::configuration(
                "no volumes provisioned; cannot dispatch workers after cleanup",
            ));
        }
        let volume = self.volumes[slot % self.volumes.len()].clone();
        let retry = self.retry_count(range);
        let mut pod = WorkerPod::new(
            slot,
            range,
            retry,
            volume,
            Arc::clone(&self.template),
            Arc::clone(&self.cluster),
        );
        let attempts = pod.start().await?;
        self.metrics.record_worker_started(attempts);

        self.task_stats.insert(
            pod.name().to_string(),
            TaskStats::new(pod.name()).with_retry_count(retry),
        );

        self.workers[slot] = Some(pod);
        Ok(())
    }

    /// Classifies a finished worker and applies the retry policy.
    ///
    /// A mismatch is recorded and never retried. An eviction deletes the pod,
    /// re-enqueues its range at the back of the backlog and bumps the range's
    /// retry count, so the next dispatch runs under a new pod name. Any other
    /// failure is recorded as a hard failure.
    pub async fn process_completed_pod(&mut self, pod: WorkerPod) -> WorkerOutcome {
        let outcome = pod.outcome().unwrap_or_else(|| WorkerOutcome::Failed {
            exit_code: None,
            reason: format!("reaped while {}", pod.phase()),
        });

        match &outcome {
            WorkerOutcome::Succeeded => {
                tracing::info!(pod = pod.name(), range = %pod.range(), "replay succeeded");
            }
            WorkerOutcome::Mismatch => {
                tracing::error!(pod = pod.name(), range = %pod.range(), "replay found a transaction mismatch");
                self.logs.mismatches.push(FailureRecord {
                    pod: pod.name().to_string(),
                    range: pod.range(),
                    exit_code: Some(ReplayExit::MISMATCH_EXIT_CODE),
                    reason: "transaction mismatch".to_string(),
                });
            }
            WorkerOutcome::Evicted => {
                tracing::warn!(pod = pod.name(), range = %pod.range(), "worker pod evicted, rescheduling");
                // The retry gets a new name; a pod left behind here goes in
                // the final cleanup.
                if let Err(err) = pod.delete_pod().await {
                    tracing::warn!(pod = pod.name(), error = %err, "failed to delete evicted pod");
                }
                self.backlog.push_back(pod.range());
                *self.evictions.entry(pod.range()).or_insert(0) += 1;
                self.metrics.record_reschedule();
            }
            WorkerOutcome::Failed { exit_code, reason } => {
                tracing::error!(
                    pod = pod.name(),
                    range = %pod.range(),
                    exit_code = ?exit_code,
                    reason = %reason,
                    "replay failed"
                );
                self.logs.failures.push(FailureRecord {
                    pod: pod.name().to_string(),
                    range: pod.range(),
                    exit_code: *exit_code,
                    reason: reason.clone(),
                });
            }
        }

        let duration = self
            .task_stats
            .get_mut(pod.name())
            .and_then(|stats| {
                stats.finish_attempt();
                stats.durations.last().copied()
            })
            .unwrap_or(Duration::ZERO);
        self.metrics.record_outcome(outcome.as_label(), duration);

        outcome
    }

    fn report(&self, logs: FailureLogs) -> ReplayReport {
        ReplayReport {
            label: self.options.label.clone(),
            network: self.config.network.as_label().to_string(),
            interval: self.interval,
            tasks_planned: self.tasks_planned,
            mismatches: logs.mismatches,
            failures: logs.failures,
            unverified: self.unverified.clone(),
            stats: self.task_stats.values().cloned().collect(),
            summary: StatsSummary::from_stats(&self.task_stats),
        }
    }
}
