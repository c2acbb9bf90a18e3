//! Version ranges and the range splitter.
//!
//! The splitter partitions a global version interval into the chunks that
//! become worker tasks:
//!
//! - **Skip-aware**: no chunk ever overlaps an honored skip range
//! - **Bounded**: every chunk is at most `chunk_size` versions
//! - **Sliver-free**: chunks shorter than `min_chunk_size` are not scheduled;
//!   they are returned separately in [`SplitPlan::dropped`] so the run can
//!   report them as unverified
//!
//! ## Skip semantics
//!
//! Only skips that start strictly after `global_start` are honored; a skip
//! already covering the start is assumed to be handled upstream. When the
//! cursor lands inside a skip it jumps to `skip.end + 1`, so the `end`
//! version itself is never scheduled either.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A half-open interval `[start, end)` of ledger versions replayed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionRange {
    start: u64,
    end: u64,
}

impl VersionRange {
    /// Creates a new range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] unless `start < end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First version in the range.
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// One past the last version in the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Number of versions in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false; a range holds at least one version.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if `version` falls inside the range.
    #[must_use]
    pub const fn contains(&self, version: u64) -> bool {
        self.start <= version && version < self.end
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A range of versions excluded from scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkipRange {
    /// First skipped version.
    pub start: u64,
    /// End of the skip; the cursor resumes at `end + 1`.
    pub end: u64,
}

impl SkipRange {
    /// Creates a new skip range.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for SkipRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skip[{}, {}]", self.start, self.end)
    }
}

/// Output of the splitter: ranges to schedule and slivers left unscheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SplitPlan {
    /// Ranges to schedule, in increasing order.
    pub tasks: Vec<VersionRange>,
    /// Ranges shorter than the minimum chunk size, in increasing order.
    pub dropped: Vec<VersionRange>,
}

impl SplitPlan {
    /// Total number of versions that will be replayed.
    #[must_use]
    pub fn scheduled_versions(&self) -> u64 {
        self.tasks.iter().map(VersionRange::len).sum()
    }

    /// Total number of versions dropped for being below the minimum size.
    #[must_use]
    pub fn dropped_versions(&self) -> u64 {
        self.dropped.iter().map(VersionRange::len).sum()
    }
}

/// Splits `[global_start, global_end)` into schedulable chunks.
///
/// See the module docs for the skip and sliver semantics. Returns only the
/// ranges to schedule; use [`plan`] to also see the dropped slivers.
#[must_use]
pub fn split(
    global_start: u64,
    global_end: u64,
    skip_ranges: &[SkipRange],
    chunk_size: u64,
    min_chunk_size: u64,
) -> Vec<VersionRange> {
    plan(global_start, global_end, skip_ranges, chunk_size, min_chunk_size).tasks
}

/// Splits `[global_start, global_end)` and reports dropped slivers alongside
/// the scheduled chunks.
///
/// A `chunk_size` of zero is treated as one.
#[must_use]
pub fn plan(
    global_start: u64,
    global_end: u64,
    skip_ranges: &[SkipRange],
    chunk_size: u64,
    min_chunk_size: u64,
) -> SplitPlan {
    let chunk_size = chunk_size.max(1);

    let mut skips: Vec<SkipRange> = skip_ranges
        .iter()
        .copied()
        .filter(|skip| skip.start > global_start)
        .collect();
    skips.sort_by_key(|skip| skip.start);
    let mut skips = skips.into_iter().peekable();

    let mut out = SplitPlan::default();
    let mut current = global_start;

    while current < global_end {
        // Skips starting at or behind the cursor either contain it (jump past)
        // or have already been passed. Either way they are consumed here.
        while let Some(skip) = skips.next_if(|skip| skip.start <= current) {
            if current < skip.end {
                current = skip.end.saturating_add(1);
            }
        }
        if current >= global_end {
            break;
        }

        let mut chunk_end = current.saturating_add(chunk_size).min(global_end);
        if let Some(next) = skips.peek() {
            chunk_end = chunk_end.min(next.start);
        }

        if chunk_end > current {
            let range = VersionRange {
                start: current,
                end: chunk_end,
            };
            if range.len() >= min_chunk_size {
                out.tasks.push(range);
            } else {
                out.dropped.push(range);
            }
            current = chunk_end;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(pairs: &[(u64, u64)]) -> Vec<VersionRange> {
        pairs
            .iter()
            .map(|&(start, end)| VersionRange::new(start, end).unwrap())
            .collect()
    }

    #[test]
    fn version_range_rejects_empty() {
        assert!(matches!(
            VersionRange::new(5, 5),
            Err(Error::InvalidRange { start: 5, end: 5 })
        ));
        assert!(VersionRange::new(6, 5).is_err());
    }

    #[test]
    fn version_range_accessors() {
        let range = VersionRange::new(10, 25).unwrap();
        assert_eq!(range.len(), 15);
        assert!(range.contains(10));
        assert!(range.contains(24));
        assert!(!range.contains(25));
        assert_eq!(range.to_string(), "[10, 25)");
    }

    #[test]
    fn splits_around_skip_range() {
        let tasks = split(0, 100, &[SkipRange::new(40, 50)], 30, 10);
        assert_eq!(tasks, ranges(&[(0, 30), (30, 40), (51, 81), (81, 100)]));
    }

    #[test]
    fn no_skips_is_fixed_size_chunking() {
        let tasks = split(0, 100, &[], 30, 1);
        assert_eq!(tasks, ranges(&[(0, 30), (30, 60), (60, 90), (90, 100)]));
    }

    #[test]
    fn short_tail_is_dropped_and_reported() {
        let plan = plan(0, 95, &[], 30, 10);
        assert_eq!(plan.tasks, ranges(&[(0, 30), (30, 60), (60, 90)]));
        assert_eq!(plan.dropped, ranges(&[(90, 95)]));
        assert_eq!(plan.scheduled_versions(), 90);
        assert_eq!(plan.dropped_versions(), 5);
    }

    #[test]
    fn sliver_before_skip_is_dropped() {
        let plan = plan(0, 100, &[SkipRange::new(33, 40)], 30, 10);
        assert_eq!(plan.tasks, ranges(&[(0, 30), (41, 71), (71, 100)]));
        assert_eq!(plan.dropped, ranges(&[(30, 33)]));
    }

    #[test]
    fn skip_at_or_before_start_is_ignored() {
        let tasks = split(10, 70, &[SkipRange::new(0, 20), SkipRange::new(10, 30)], 30, 1);
        assert_eq!(tasks, ranges(&[(10, 40), (40, 70)]));
    }

    #[test]
    fn skip_abutting_global_end() {
        let tasks = split(0, 100, &[SkipRange::new(90, 100)], 30, 1);
        assert_eq!(tasks, ranges(&[(0, 30), (30, 60), (60, 90)]));
    }

    #[test]
    fn skip_past_global_end_truncates() {
        let tasks = split(0, 100, &[SkipRange::new(80, 500)], 50, 1);
        assert_eq!(tasks, ranges(&[(0, 50), (50, 80)]));
    }

    #[test]
    fn unsorted_and_nested_skips() {
        let skips = [
            SkipRange::new(60, 65),
            SkipRange::new(20, 40),
            SkipRange::new(25, 30),
        ];
        let tasks = split(0, 100, &skips, 100, 1);
        assert_eq!(tasks, ranges(&[(0, 20), (41, 60), (66, 100)]));
    }

    #[test]
    fn overlapping_skips_chain_jumps() {
        let skips = [SkipRange::new(40, 50), SkipRange::new(45, 60)];
        let tasks = split(0, 100, &skips, 100, 1);
        assert_eq!(tasks, ranges(&[(0, 40), (61, 100)]));
    }

    #[test]
    fn empty_skip_does_not_stall() {
        let tasks = split(0, 20, &[SkipRange::new(10, 10)], 100, 1);
        assert_eq!(tasks, ranges(&[(0, 10), (10, 20)]));
    }

    #[test]
    fn empty_interval_yields_nothing() {
        assert!(split(50, 50, &[], 10, 1).is_empty());
        assert!(split(60, 50, &[], 10, 1).is_empty());
    }

    #[test]
    fn near_u64_max_does_not_overflow() {
        let start = u64::MAX - 10;
        let tasks = split(start, u64::MAX, &[SkipRange::new(u64::MAX - 5, u64::MAX)], 100, 1);
        assert_eq!(tasks, ranges(&[(start, u64::MAX - 5)]));
    }
}
