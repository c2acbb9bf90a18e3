//! Error types for replay verification.

use crate::range::VersionRange;

/// The result type used throughout replay-verify.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning or scheduling a replay run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A version range with `start >= end` was requested.
    #[error("invalid version range: [{start}, {end})")]
    InvalidRange {
        /// Requested start version.
        start: u64,
        /// Requested end version.
        end: u64,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// The skip-range source could not be parsed.
    #[error("invalid skip-range source: {message}")]
    SkipSource {
        /// Description of the parse failure.
        message: String,
    },

    /// A worker pod could not be created after exhausting all attempts.
    #[error("failed to launch worker {pod} for {range} after {attempts} attempts: {message}")]
    LaunchFailed {
        /// Name of the worker pod.
        pod: String,
        /// Range the worker was meant to replay.
        range: VersionRange,
        /// Number of attempts made.
        attempts: u32,
        /// Last error reported by the cluster.
        message: String,
    },

    /// The volume provisioner returned a different number of volumes than requested.
    #[error("volume provisioner returned {actual} volumes, expected {expected}")]
    VolumeCountMismatch {
        /// Requested pool size.
        expected: usize,
        /// Number of handles actually returned.
        actual: usize,
    },

    /// Resources of an earlier run under the same label outlived the reset.
    #[error("{remaining} resources labelled {label} still present after waiting {waited:?}")]
    TeardownTimeout {
        /// Run label being reset.
        label: String,
        /// Pods and volumes still present.
        remaining: usize,
        /// How long the reset waited.
        waited: std::time::Duration,
    },

    /// A cluster API call failed.
    #[error("cluster error: {message}")]
    Cluster {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new skip-source error.
    #[must_use]
    pub fn skip_source(message: impl Into<String>) -> Self {
        Self::SkipSource {
            message: message.into(),
        }
    }

    /// Creates a new cluster error.
    #[must_use]
    pub fn cluster(message: impl Into<String>) -> Self {
        Self::Cluster {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new cluster error with a source.
    #[must_use]
    pub fn cluster_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cluster {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn invalid_range_display() {
        let err = Error::InvalidRange { start: 10, end: 5 };
        assert_eq!(err.to_string(), "invalid version range: [10, 5)");
    }

    #[test]
    fn launch_failed_display() {
        let err = Error::LaunchFailed {
            pod: "rv-0-100".into(),
            range: VersionRange::new(0, 100).unwrap(),
            attempts: 5,
            message: "quota exceeded".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("rv-0-100"));
        assert!(msg.contains("[0, 100)"));
        assert!(msg.contains("5 attempts"));
        assert!(msg.contains("quota exceeded"));
    }

    #[test]
    fn volume_count_mismatch_display() {
        let err = Error::VolumeCountMismatch {
            expected: 8,
            actual: 3,
        };
        assert!(err.to_string().contains("expected 8"));
    }

    #[test]
    fn teardown_timeout_display() {
        let err = Error::TeardownTimeout {
            label: "rv-old".into(),
            remaining: 3,
            waited: std::time::Duration::from_secs(300),
        };
        assert_eq!(
            err.to_string(),
            "3 resources labelled rv-old still present after waiting 300s"
        );
    }

    #[test]
    fn cluster_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::cluster_with_source("create pod failed", source);
        assert!(err.to_string().contains("cluster error"));
        assert!(StdError::source(&err).is_some());
    }
}
