//! Replay configuration.
//!
//! [`ReplayConfig`] holds the static tuning parameters for one target network;
//! [`SchedulerOptions`] holds the per-run knobs (worker count, labels, image,
//! polling and launch-retry cadence).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One GiB in bytes.
const GIB: u64 = 1024 * 1024 * 1024;

/// Default interval between scans of the worker slots.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of attempts when creating a worker pod.
pub const DEFAULT_LAUNCH_ATTEMPTS: u32 = 5;

/// Default delay between worker pod creation attempts.
pub const DEFAULT_LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default wait for a previous run's resources to terminate on reset.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest run label the cluster accepts as a label value.
pub const MAX_LABEL_LEN: usize = 63;

/// Default namespace for worker pods and volumes.
pub const DEFAULT_NAMESPACE: &str = "replay-verify";

/// Default path of the replay binary inside the worker image.
pub const DEFAULT_REPLAY_BINARY: &str = "/usr/local/bin/aptos-debugger";

/// Default mount path of the archival snapshot inside the worker.
pub const DEFAULT_TARGET_DB_DIR: &str = "/mnt/archive/db";

/// Default worker image repository.
pub const DEFAULT_IMAGE_REPOSITORY: &str = "aptoslabs/tools";

/// Target network whose history is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Public test network.
    Testnet,
    /// Main network.
    Mainnet,
}

impl Network {
    /// Returns a lowercase label suitable for names, metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Testnet => "testnet",
            Self::Mainnet => "mainnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "testnet" => Ok(Self::Testnet),
            "mainnet" => Ok(Self::Mainnet),
            other => Err(Error::configuration(format!("unknown network: {other}"))),
        }
    }
}

/// Static tuning parameters for replaying one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Network these parameters apply to.
    pub network: Network,
    /// Concurrency level passed to each worker's replay process.
    pub replay_concurrency_level: u32,
    /// Number of snapshot volumes provisioned for the run.
    pub volume_pool_size: usize,
    /// Chunks shorter than this are not scheduled.
    pub min_range_size: u64,
    /// Target number of versions per chunk.
    pub range_size: u64,
    /// Wall-clock limit enforced by the worker itself.
    pub timeout_secs: u64,
    /// Block cache size passed to the worker, in bytes.
    pub block_cache_size: u64,
    /// Whether the archival db uses storage sharding.
    pub enable_storage_sharding: bool,
    /// Worker count used when none is requested explicitly.
    pub default_worker_cnt: usize,
    /// Volume snapshot the worker volumes are cloned from.
    pub snapshot_name: String,
}

impl ReplayConfig {
    /// Returns the tuned defaults for `network`.
    #[must_use]
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Testnet => Self {
                network,
                replay_concurrency_level: 4,
                volume_pool_size: 5,
                min_range_size: 10_000,
                range_size: 5_000_000,
                timeout_secs: 900,
                block_cache_size: 10 * GIB,
                enable_storage_sharding: true,
                default_worker_cnt: 32,
                snapshot_name: "testnet-archive".to_string(),
            },
            Network::Mainnet => Self {
                network,
                replay_concurrency_level: 4,
                volume_pool_size: 8,
                min_range_size: 10_000,
                range_size: 2_000_000,
                timeout_secs: 400,
                block_cache_size: 10 * GIB,
                enable_storage_sharding: true,
                default_worker_cnt: 32,
                snapshot_name: "mainnet-archive".to_string(),
            },
        }
    }

    /// Overrides the target chunk size.
    #[must_use]
    pub const fn with_range_size(mut self, range_size: u64) -> Self {
        self.range_size = range_size;
        self
    }

    /// Overrides the minimum chunk size.
    #[must_use]
    pub const fn with_min_range_size(mut self, min_range_size: u64) -> Self {
        self.min_range_size = min_range_size;
        self
    }

    /// Overrides the volume pool size.
    #[must_use]
    pub const fn with_volume_pool_size(mut self, volume_pool_size: usize) -> Self {
        self.volume_pool_size = volume_pool_size;
        self
    }

    /// Checks the parameters for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero chunk size, pool size or
    /// concurrency level, or a minimum chunk size above the target size.
    pub fn validate(&self) -> Result<()> {
        if self.range_size == 0 {
            return Err(Error::configuration("range_size must be greater than zero"));
        }
        if self.min_range_size > self.range_size {
            return Err(Error::configuration(format!(
                "min_range_size ({}) exceeds range_size ({})",
                self.min_range_size, self.range_size
            )));
        }
        if self.volume_pool_size == 0 {
            return Err(Error::configuration(
                "volume_pool_size must be greater than zero",
            ));
        }
        if self.replay_concurrency_level == 0 {
            return Err(Error::configuration(
                "replay_concurrency_level must be greater than zero",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::configuration("timeout_secs must be greater than zero"));
        }
        Ok(())
    }
}

/// Per-run scheduling options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Number of concurrent worker slots.
    pub worker_cnt: usize,
    /// Label stamped on every pod and volume of the run; also the name prefix.
    pub label: String,
    /// Cluster namespace.
    pub namespace: String,
    /// Full worker image reference.
    pub image: String,
    /// Replay binary path inside the image.
    pub replay_binary: String,
    /// Archival db path inside the worker.
    pub target_db_dir: String,
    /// Sleep between slot scans.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Attempts made to create a worker pod before giving up.
    pub launch_attempts: u32,
    /// Sleep between pod creation attempts.
    #[serde(with = "duration_secs")]
    pub launch_retry_delay: Duration,
    /// How long a reset waits for a previous run's resources to go away.
    #[serde(with = "duration_secs", default = "default_teardown_timeout")]
    pub teardown_timeout: Duration,
}

const fn default_teardown_timeout() -> Duration {
    DEFAULT_TEARDOWN_TIMEOUT
}

impl SchedulerOptions {
    /// Creates options with defaults for everything but the label and image.
    #[must_use]
    pub fn new(worker_cnt: usize, label: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            worker_cnt,
            label: label.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: image.into(),
            replay_binary: DEFAULT_REPLAY_BINARY.to_string(),
            target_db_dir: DEFAULT_TARGET_DB_DIR.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            launch_attempts: DEFAULT_LAUNCH_ATTEMPTS,
            launch_retry_delay: DEFAULT_LAUNCH_RETRY_DELAY,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the slot scan interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the pod creation retry policy.
    #[must_use]
    pub const fn with_launch_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.launch_attempts = attempts;
        self.launch_retry_delay = delay;
        self
    }

    /// Sets how long a reset waits for leftovers to terminate.
    #[must_use]
    pub const fn with_teardown_timeout(mut self, teardown_timeout: Duration) -> Self {
        self.teardown_timeout = teardown_timeout;
        self
    }

    /// Checks the options for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero worker count or attempt
    /// ceiling, an empty image, or a label that is not a DNS-1123 label.
    pub fn validate(&self) -> Result<()> {
        if self.worker_cnt == 0 {
            return Err(Error::configuration("worker_cnt must be greater than zero"));
        }
        if self.launch_attempts == 0 {
            return Err(Error::configuration(
                "launch_attempts must be greater than zero",
            ));
        }
        validate_label(&self.label)?;
        if self.image.is_empty() {
            return Err(Error::configuration("image cannot be empty"));
        }
        Ok(())
    }
}

/// Checks that `label` is a DNS-1123 label: at most 63 lowercase
/// alphanumerics or `-`, starting and ending with an alphanumeric.
///
/// Pod names, volume names and label selectors are all derived from it.
///
/// # Errors
///
/// Returns a configuration error naming the first rule the label breaks.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::configuration("label cannot be empty"));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(Error::configuration(format!(
            "label {label:?} is {} characters; at most {MAX_LABEL_LEN} are allowed",
            label.len()
        )));
    }
    if let Some(bad) = label
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(Error::configuration(format!(
            "label {label:?} contains {bad:?}; only lowercase letters, digits and '-' are allowed"
        )));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(Error::configuration(format!(
            "label {label:?} must start and end with a letter or digit"
        )));
    }
    Ok(())
}

/// Builds the full image reference for a tag.
#[must_use]
pub fn image_for_tag(tag: &str) -> String {
    format!("{DEFAULT_IMAGE_REPOSITORY}:{tag}")
}

/// Generates a unique run label, e.g. `rv-testnet-01hx...`.
///
/// Labels double as pod name prefixes, so they are lowercase and short.
#[must_use]
pub fn generate_label(network: Network) -> String {
    let id = ulid::Ulid::new().to_string().to_ascii_lowercase();
    format!("rv-{}-{}", network.as_label(), &id[id.len() - 8..])
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
