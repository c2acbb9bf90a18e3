//! Skip-range source.
//!
//! The known-good interval of a network and the ranges excluded from replay
//! are published as a JSON document:
//!
//! ```json
//! {
//!   "start": 0,
//!   "end": 1000000,
//!   "skip_ranges": [
//!     { "start_version": "4000", "end_version": "5000" }
//!   ]
//! }
//! ```
//!
//! Skip bounds are decimal strings. Where the document lives is up to the
//! caller; this module only reads a string or a local file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::range::SkipRange;

#[derive(Debug, Deserialize)]
struct RawSkipFile {
    start: u64,
    end: u64,
    #[serde(default)]
    skip_ranges: Vec<RawSkipRange>,
}

#[derive(Debug, Deserialize)]
struct RawSkipRange {
    start_version: String,
    end_version: String,
}

/// Parsed skip-range document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipRangeFile {
    /// First version of the known-good interval.
    pub start: u64,
    /// End of the known-good interval.
    pub end: u64,
    /// Excluded sub-ranges, in document order.
    pub skip_ranges: Vec<SkipRange>,
}

impl SkipRangeFile {
    /// Parses a skip-range document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SkipSource`] if the JSON is malformed, a version is
    /// not a decimal `u64`, or a range is inverted.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawSkipFile = serde_json::from_str(json)
            .map_err(|e| Error::skip_source(format!("malformed skip-range json: {e}")))?;

        if raw.start >= raw.end {
            return Err(Error::skip_source(format!(
                "known-good interval is empty: start={} end={}",
                raw.start, raw.end
            )));
        }

        let skip_ranges = raw
            .skip_ranges
            .iter()
            .map(|r| {
                let start = parse_version(&r.start_version)?;
                let end = parse_version(&r.end_version)?;
                if start > end {
                    return Err(Error::skip_source(format!(
                        "skip range is inverted: start_version={start} end_version={end}"
                    )));
                }
                Ok(SkipRange::new(start, end))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            start: raw.start,
            end: raw.end,
            skip_ranges,
        })
    }

    /// Reads and parses a skip-range document from a local file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or any error from
    /// [`SkipRangeFile::from_json`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Resolves the interval to replay from optional user overrides.
    ///
    /// Missing bounds default to the known-good interval.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an override falls outside the
    /// known-good interval or the resolved interval is empty.
    pub fn resolve_interval(&self, start: Option<u64>, end: Option<u64>) -> Result<(u64, u64)> {
        let start = start.unwrap_or(self.start);
        let end = end.unwrap_or(self.end);

        if start < self.start || start >= self.end {
            return Err(Error::configuration(format!(
                "start {start} is outside the known-good interval [{}, {})",
                self.start, self.end
            )));
        }
        if end > self.end || end <= self.start {
            return Err(Error::configuration(format!(
                "end {end} is outside the known-good interval [{}, {})",
                self.start, self.end
            )));
        }
        if start >= end {
            return Err(Error::configuration(format!(
                "start {start} must be below end {end}"
            )));
        }
        Ok((start, end))
    }
}

fn parse_version(raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| Error::skip_source(format!("invalid version {raw:?}: {e}")))
}
