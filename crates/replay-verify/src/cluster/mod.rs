//! Cluster collaborators for worker pods and snapshot volumes.
//!
//! This module provides:
//!
//! - [`ClusterClient`]: Trait for creating, polling and deleting worker pods
//! - [`VolumeProvisioner`]: Trait for cloning snapshot volumes for a run
//! - [`PodSpec`] / [`PodStatus`]: Launch and status payloads exchanged with the cluster
//! - [`memory::InMemoryCluster`]: Scripted in-memory cluster for testing
//! - `kube::KubeClient`: Kubernetes REST implementation (feature `kube`)
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: The scheduler only sees these traits
//! - **Label scoped**: Every pod and volume of a run carries the run label, so
//!   teardown is a label-selector delete
//! - **Raw status**: Implementations report what the cluster says; outcome
//!   classification lives in [`crate::pod`]

pub mod memory;

#[cfg(feature = "kube")]
pub mod kube;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Label key carrying the run label on pods and volumes.
pub const RUN_LABEL_KEY: &str = "run";

/// Failure reason the cluster reports for pods it evicted.
pub const EVICTED_REASON: &str = "Evicted";

/// Opaque handle of a provisioned snapshot volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeHandle(String);

impl VolumeHandle {
    /// Wraps a volume name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the volume name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the cluster needs to launch one worker pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Unique pod name.
    pub name: String,
    /// Namespace the pod is created in.
    pub namespace: String,
    /// Container image reference.
    pub image: String,
    /// Pod labels; always includes [`RUN_LABEL_KEY`].
    pub labels: BTreeMap<String, String>,
    /// Container command line.
    pub command: Vec<String>,
    /// Snapshot volume mounted read-only into the container.
    pub volume: VolumeHandle,
    /// Mount path of the volume.
    pub mount_path: String,
}

impl PodSpec {
    /// Returns the run label of the pod, if present.
    #[must_use]
    pub fn run_label(&self) -> Option<&str> {
        self.labels.get(RUN_LABEL_KEY).map(String::as_str)
    }
}

/// Raw lifecycle phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemotePhase {
    /// Accepted but containers not yet running.
    Pending,
    /// At least one container is running.
    Running,
    /// All containers exited with success.
    Succeeded,
    /// At least one container failed or the pod was killed.
    Failed,
    /// The cluster could not determine the state.
    Unknown,
}

impl RemotePhase {
    /// Parses the phase string used by the Kubernetes API.
    #[must_use]
    pub fn from_api(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Status snapshot of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    /// Lifecycle phase.
    pub phase: RemotePhase,
    /// Failure reason reported by the cluster (e.g. `Evicted`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Exit code of the replay container, once it terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl PodStatus {
    /// A pod that has not started running yet.
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            phase: RemotePhase::Pending,
            reason: None,
            exit_code: None,
        }
    }

    /// A running pod.
    #[must_use]
    pub const fn running() -> Self {
        Self {
            phase: RemotePhase::Running,
            reason: None,
            exit_code: None,
        }
    }

    /// A pod whose container exited cleanly.
    #[must_use]
    pub const fn succeeded() -> Self {
        Self {
            phase: RemotePhase::Succeeded,
            reason: None,
            exit_code: Some(0),
        }
    }

    /// A pod whose container exited with `exit_code`.
    #[must_use]
    pub const fn exited(exit_code: i32) -> Self {
        Self {
            phase: RemotePhase::Failed,
            reason: None,
            exit_code: Some(exit_code),
        }
    }

    /// A pod the cluster evicted.
    #[must_use]
    pub fn evicted() -> Self {
        Self {
            phase: RemotePhase::Failed,
            reason: Some(EVICTED_REASON.to_string()),
            exit_code: None,
        }
    }
}

/// Request to clone snapshot volumes for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Run identifier used in volume names.
    pub run_id: String,
    /// Snapshot to clone.
    pub snapshot_name: String,
    /// Namespace the volumes are created in.
    pub namespace: String,
    /// Number of volumes to create.
    pub count: usize,
    /// Run label stamped on every volume.
    pub label: String,
}

/// Cluster API used to run worker pods.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; the scheduler shares one client across all
/// of its worker pods.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Creates a pod from `spec`.
    async fn create_pod(&self, spec: &PodSpec) -> Result<()>;

    /// Fetches the current status of the named pod.
    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus>;

    /// Deletes the named pod. Deleting a missing pod is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Deletes every pod carrying the run label and returns how many went away.
    async fn delete_pods_by_label(&self, namespace: &str, label: &str) -> Result<usize>;

    /// Deletes every volume carrying the run label and returns how many went away.
    async fn delete_volumes_by_label(&self, namespace: &str, label: &str) -> Result<usize>;

    /// Counts pods and volumes carrying the run label, including ones the
    /// cluster is still terminating.
    async fn count_by_label(&self, namespace: &str, label: &str) -> Result<usize>;
}

/// Provisioner that clones snapshot volumes for the worker pool.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Creates `request.count` volumes from the snapshot and returns their handles.
    async fn create_volumes_from_snapshot(&self, request: &VolumeRequest)
        -> Result<Vec<VolumeHandle>>;
}
