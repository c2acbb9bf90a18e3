//! Observability metrics for replay scheduling.
//!
//! Metrics go through the `metrics` crate facade; without an installed
//! recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `replay_verify_workers_started_total` | Counter | - | Worker pods created |
//! | `replay_verify_launch_attempts_total` | Counter | `result` | Pod creation attempts |
//! | `replay_verify_worker_outcomes_total` | Counter | `outcome` | Terminal worker outcomes |
//! | `replay_verify_reschedules_total` | Counter | - | Ranges re-enqueued after eviction |
//! | `replay_verify_attempt_duration_seconds` | Histogram | `outcome` | Worker attempt wall-clock time |
//! | `replay_verify_scan_duration_seconds` | Histogram | - | One scan over all worker slots |
//! | `replay_verify_backlog_depth` | Gauge | - | Ranges waiting for a slot |
//! | `replay_verify_active_workers` | Gauge | - | Occupied worker slots |
//! | `replay_verify_unverified_versions` | Gauge | - | Versions dropped by the splitter |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Worker pods created.
    pub const WORKERS_STARTED_TOTAL: &str = "replay_verify_workers_started_total";
    /// Counter: Pod creation attempts by result.
    pub const LAUNCH_ATTEMPTS_TOTAL: &str = "replay_verify_launch_attempts_total";
    /// Counter: Terminal worker outcomes.
    pub const WORKER_OUTCOMES_TOTAL: &str = "replay_verify_worker_outcomes_total";
    /// Counter: Ranges re-enqueued after eviction.
    pub const RESCHEDULES_TOTAL: &str = "replay_verify_reschedules_total";
    /// Histogram: Worker attempt duration in seconds.
    pub const ATTEMPT_DURATION_SECONDS: &str = "replay_verify_attempt_duration_seconds";
    /// Histogram: Slot scan duration in seconds.
    pub const SCAN_DURATION_SECONDS: &str = "replay_verify_scan_duration_seconds";
    /// Gauge: Ranges waiting for a slot.
    pub const BACKLOG_DEPTH: &str = "replay_verify_backlog_depth";
    /// Gauge: Occupied worker slots.
    pub const ACTIVE_WORKERS: &str = "replay_verify_active_workers";
    /// Gauge: Versions dropped by the splitter.
    pub const UNVERIFIED_VERSIONS: &str = "replay_verify_unverified_versions";
}

/// Label keys used across metrics.
pub mod labels {
    /// Worker outcome (succeeded, evicted, mismatch, failed).
    pub const OUTCOME: &str = "outcome";
    /// Result status (success, failure).
    pub const RESULT: &str = "result";
}

/// High-level interface for recording replay metrics.
#[derive(Debug, Clone, Default)]
pub struct ReplayMetrics;

impl ReplayMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a created worker pod and the attempts it took.
    pub fn record_worker_started(&self, attempts: u32) {
        counter!(names::WORKERS_STARTED_TOTAL).increment(1);
        counter!(names::LAUNCH_ATTEMPTS_TOTAL, labels::RESULT => "success").increment(1);
        if attempts > 1 {
            counter!(names::LAUNCH_ATTEMPTS_TOTAL, labels::RESULT => "failure")
                .increment(u64::from(attempts - 1));
        }
    }

    /// Records a terminal worker outcome and its attempt duration.
    pub fn record_outcome(&self, outcome: &str, duration: Duration) {
        counter!(
            names::WORKER_OUTCOMES_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(
            names::ATTEMPT_DURATION_SECONDS,
            labels::OUTCOME => outcome.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a range re-enqueued after eviction.
    pub fn record_reschedule(&self) {
        counter!(names::RESCHEDULES_TOTAL).increment(1);
    }

    /// Sets the backlog depth gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_backlog_depth(&self, depth: usize) {
        gauge!(names::BACKLOG_DEPTH).set(depth as f64);
    }

    /// Sets the occupied worker slot gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_workers(&self, count: usize) {
        gauge!(names::ACTIVE_WORKERS).set(count as f64);
    }

    /// Sets the unverified versions gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_unverified_versions(&self, versions: u64) {
        gauge!(names::UNVERIFIED_VERSIONS).set(versions as f64);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for one scan over the worker slots.
#[must_use]
pub fn time_scan() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::SCAN_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_record_without_recorder() {
        let metrics = ReplayMetrics::new();
        metrics.record_worker_started(3);
        metrics.record_outcome("evicted", Duration::from_secs(5));
        metrics.record_reschedule();
        metrics.set_backlog_depth(10);
        metrics.set_active_workers(4);
        metrics.set_unverified_versions(42);
    }

    #[test]
    fn timing_guard_reports_on_drop() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }

    #[test]
    fn scan_guard_does_not_panic() {
        let guard = time_scan();
        assert!(guard.elapsed() < Duration::from_secs(60));
    }
}
