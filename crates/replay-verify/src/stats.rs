//! Per-task timing and retry telemetry.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Telemetry for one worker pod name.
///
/// Every dispatch runs under a fresh pod name, so a retried range
/// contributes a new entry that inherits the range's eviction count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Worker pod name the entry is keyed by.
    pub name: String,
    /// When the pod was dispatched.
    pub start_time: DateTime<Utc>,
    /// When the pod was observed in a terminal phase.
    pub end_time: Option<DateTime<Utc>>,
    /// Number of times the range had been re-enqueued when this pod was
    /// dispatched.
    pub retry_count: u32,
    /// Wall-clock duration of each completed span.
    #[serde(serialize_with = "serialize_secs")]
    pub durations: Vec<Duration>,
    #[serde(skip)]
    attempt_started_at: Option<DateTime<Utc>>,
}

impl TaskStats {
    /// Creates an entry whose span starts now.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::new_at(name, Utc::now())
    }

    /// Creates an entry whose span starts at `at`.
    #[must_use]
    pub fn new_at(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            start_time: at,
            end_time: None,
            retry_count: 0,
            durations: Vec::new(),
            attempt_started_at: Some(at),
        }
    }

    /// Carries over the eviction count of the range.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Closes the open attempt span at `at`.
    ///
    /// Stamps `end_time` and appends the span's duration. Calling this
    /// without an open span only updates `end_time`.
    pub fn finish_attempt_at(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
        if let Some(started) = self.attempt_started_at.take() {
            self.durations
                .push((at - started).to_std().unwrap_or_default());
        }
    }

    /// Closes the open attempt span now.
    pub fn finish_attempt(&mut self) {
        self.finish_attempt_at(Utc::now());
    }

    /// Returns true while an attempt is dispatched and not yet finished.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        self.attempt_started_at.is_some()
    }

    /// Sum of all completed attempt durations.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.durations.iter().sum()
    }
}

impl fmt::Display for TaskStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: attempts={} retries={} total={:.1}s",
            self.name,
            self.durations.len(),
            self.retry_count,
            self.total_duration().as_secs_f64()
        )
    }
}

/// Aggregate view over all task stats of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSummary {
    /// Number of distinct task names dispatched.
    pub task_count: usize,
    /// Number of completed attempts across all tasks.
    pub attempt_count: usize,
    /// Number of dispatches that replayed an evicted range again.
    pub total_retries: u32,
    /// Mean attempt duration in seconds.
    pub mean_attempt_secs: f64,
    /// Longest single attempt in seconds.
    pub max_attempt_secs: f64,
    /// Task with the longest single attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slowest_task: Option<String>,
}

impl StatsSummary {
    /// Summarizes a stats table.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_stats(stats: &BTreeMap<String, TaskStats>) -> Self {
        let mut summary = Self {
            task_count: stats.len(),
            ..Self::default()
        };
        let mut total = Duration::ZERO;
        let mut max = Duration::ZERO;

        for entry in stats.values() {
            if entry.retry_count > 0 {
                summary.total_retries += 1;
            }
            summary.attempt_count += entry.durations.len();
            for duration in &entry.durations {
                total += *duration;
                if *duration >= max {
                    max = *duration;
                    summary.slowest_task = Some(entry.name.clone());
                }
            }
        }

        if summary.attempt_count > 0 {
            summary.mean_attempt_secs = total.as_secs_f64() / summary.attempt_count as f64;
        }
        summary.max_attempt_secs = max.as_secs_f64();
        summary
    }
}

fn serialize_secs<S: Serializer>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(durations.iter().map(Duration::as_secs_f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn single_attempt_records_duration() {
        let mut stats = TaskStats::new_at("rv-0-100", at(0));
        assert!(stats.is_in_flight());
        stats.finish_attempt_at(at(42));

        assert!(!stats.is_in_flight());
        assert_eq!(stats.end_time, Some(at(42)));
        assert_eq!(stats.durations, vec![Duration::from_secs(42)]);
        assert_eq!(stats.retry_count, 0);
    }

    #[test]
    fn retry_entry_inherits_eviction_count() {
        let mut first = TaskStats::new_at("rv-0-100", at(0));
        first.finish_attempt_at(at(10));

        let mut retry = TaskStats::new_at("rv-0-100-retry-1", at(20)).with_retry_count(1);
        retry.finish_attempt_at(at(50));

        assert_eq!(first.retry_count, 0);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.durations, vec![Duration::from_secs(30)]);
        assert_eq!(retry.start_time, at(20));
        assert_eq!(retry.end_time, Some(at(50)));
    }

    #[test]
    fn finishing_twice_does_not_double_count() {
        let mut stats = TaskStats::new_at("t", at(0));
        stats.finish_attempt_at(at(5));
        stats.finish_attempt_at(at(9));
        assert_eq!(stats.durations.len(), 1);
        assert_eq!(stats.end_time, Some(at(9)));
    }

    #[test]
    fn clock_skew_clamps_to_zero() {
        let mut stats = TaskStats::new_at("t", at(10));
        stats.finish_attempt_at(at(5));
        assert_eq!(stats.durations, vec![Duration::ZERO]);
    }

    #[test]
    fn summary_aggregates() {
        let mut table = BTreeMap::new();
        let mut a = TaskStats::new_at("a", at(0));
        a.finish_attempt_at(at(10));
        let mut a_retry1 = TaskStats::new_at("a-retry-1", at(10)).with_retry_count(1);
        a_retry1.finish_attempt_at(at(40));
        let mut a_retry2 = TaskStats::new_at("a-retry-2", at(40)).with_retry_count(2);
        a_retry2.finish_attempt_at(at(45));
        let mut b = TaskStats::new_at("b", at(0));
        b.finish_attempt_at(at(20));
        for entry in [a, a_retry1, a_retry2, b] {
            table.insert(entry.name.clone(), entry);
        }

        let summary = StatsSummary::from_stats(&table);
        assert_eq!(summary.task_count, 4);
        assert_eq!(summary.attempt_count, 4);
        assert_eq!(summary.total_retries, 2);
        assert!((summary.mean_attempt_secs - 16.25).abs() < f64::EPSILON);
        assert!((summary.max_attempt_secs - 30.0).abs() < f64::EPSILON);
        assert_eq!(summary.slowest_task.as_deref(), Some("a-retry-1"));
    }

    #[test]
    fn serializes_durations_as_seconds() {
        let mut stats = TaskStats::new_at("t", at(0));
        stats.finish_attempt_at(at(3));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["durations"][0], 3.0);
        assert!(json.get("attempt_started_at").is_none());
    }
}
