//! In-memory cluster implementation for testing.
//!
//! This module provides [`InMemoryCluster`], a scripted implementation of
//! [`ClusterClient`] and [`VolumeProvisioner`] suitable for tests and dry runs.
//!
//! ## Scripting
//!
//! Each pod creation consumes the next status script registered for that pod
//! name (or the default script). Every status poll returns the head of the
//! script and advances it; the last status repeats forever.
//!
//! ## Deletion
//!
//! Deletes are immediate by default. [`InMemoryCluster::delay_deletions`]
//! makes deleted pods and volumes linger as terminating: they keep their
//! names (so re-creating them fails) until [`ClusterClient::count_by_label`]
//! has observed them the configured number of times.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: Nothing actually runs
//! - **Single-process only**: State is lost when the process exits

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{
    ClusterClient, PodSpec, PodStatus, RemotePhase, VolumeHandle, VolumeProvisioner,
    VolumeRequest,
};
use crate::error::{Error, Result};

#[derive(Debug)]
struct PodEntry {
    spec: PodSpec,
    script: VecDeque<PodStatus>,
    observed: PodStatus,
}

impl PodEntry {
    fn is_active(&self) -> bool {
        !matches!(
            self.observed.phase,
            RemotePhase::Succeeded | RemotePhase::Failed
        )
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    pods: BTreeMap<String, PodEntry>,
    scripts: HashMap<String, VecDeque<Vec<PodStatus>>>,
    volumes: BTreeMap<String, String>,
    created: Vec<PodSpec>,
    deleted: Vec<String>,
    fail_creates: u32,
    fail_deletes: u32,
    fail_polls: HashMap<String, u32>,
    deletion_delay: u32,
    terminating_pods: HashMap<String, u32>,
    terminating_volumes: HashMap<String, u32>,
    peak_active: usize,
    volume_shortfall: usize,
}

/// Scripted in-memory cluster.
///
/// ## Example
///
/// ```rust
/// use replay_verify::cluster::PodStatus;
/// use replay_verify::cluster::memory::InMemoryCluster;
///
/// let cluster = InMemoryCluster::new();
/// cluster.script_pod("rv-0-100", vec![PodStatus::running(), PodStatus::exited(2)]);
/// ```
#[derive(Debug)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    default_script: Vec<PodStatus>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a cluster error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::cluster("in-memory cluster lock poisoned")
}

impl ClusterState {
    /// Removes the pod now, or marks it terminating under a deletion delay.
    fn delete_pod(&mut self, name: &str) {
        if self.deletion_delay == 0 {
            self.pods.remove(name);
        } else if self.pods.contains_key(name) {
            let delay = self.deletion_delay;
            self.terminating_pods.entry(name.to_string()).or_insert(delay);
        }
    }

    /// Removes the volume now, or marks it terminating under a deletion delay.
    fn delete_volume(&mut self, name: &str) {
        if self.deletion_delay == 0 {
            self.volumes.remove(name);
        } else if self.volumes.contains_key(name) {
            let delay = self.deletion_delay;
            self.terminating_volumes.entry(name.to_string()).or_insert(delay);
        }
    }

    /// Advances every terminating resource by one observation.
    fn advance_terminations(&mut self) {
        for name in tick(&mut self.terminating_pods) {
            self.pods.remove(&name);
        }
        for name in tick(&mut self.terminating_volumes) {
            self.volumes.remove(&name);
        }
    }
}

/// Counts down every pending deletion and returns the names that finished.
fn tick(pending: &mut HashMap<String, u32>) -> Vec<String> {
    let mut finished = Vec::new();
    pending.retain(|name, left| {
        *left = left.saturating_sub(1);
        if *left == 0 {
            finished.push(name.clone());
        }
        *left > 0
    });
    finished
}

impl InMemoryCluster {
    /// Creates a cluster where every pod runs once and then succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_script(vec![PodStatus::running(), PodStatus::succeeded()])
    }

    /// Creates a cluster whose unscripted pods follow `script`.
    ///
    /// An empty script is treated as immediate success.
    #[must_use]
    pub fn with_default_script(script: Vec<PodStatus>) -> Self {
        let default_script = if script.is_empty() {
            vec![PodStatus::succeeded()]
        } else {
            script
        };
        Self {
            state: RwLock::new(ClusterState::default()),
            default_script,
        }
    }

    /// Queues a status script for the next creation of pod `name`.
    ///
    /// Scripts queue up per name, so a pod that is evicted and recreated can
    /// be given a different script for each attempt.
    pub fn script_pod(&self, name: impl Into<String>, script: Vec<PodStatus>) {
        if let Ok(mut state) = self.state.write() {
            state
                .scripts
                .entry(name.into())
                .or_default()
                .push_back(script);
        }
    }

    /// Makes the next `count` pod creations fail.
    pub fn fail_next_creates(&self, count: u32) {
        if let Ok(mut state) = self.state.write() {
            state.fail_creates = count;
        }
    }

    /// Makes the next `count` single-pod deletes fail.
    pub fn fail_next_deletes(&self, count: u32) {
        if let Ok(mut state) = self.state.write() {
            state.fail_deletes = count;
        }
    }

    /// Keeps deleted pods and volumes around as terminating until
    /// `observations` label counts have seen them.
    pub fn delay_deletions(&self, observations: u32) {
        if let Ok(mut state) = self.state.write() {
            state.deletion_delay = observations;
        }
    }

    /// Makes the next `count` status polls of pod `name` fail.
    pub fn fail_status_polls(&self, name: impl Into<String>, count: u32) {
        if let Ok(mut state) = self.state.write() {
            state.fail_polls.insert(name.into(), count);
        }
    }

    /// Makes the provisioner return `shortfall` fewer volumes than requested.
    pub fn short_volumes(&self, shortfall: usize) {
        if let Ok(mut state) = self.state.write() {
            state.volume_shortfall = shortfall;
        }
    }

    /// Specs of every successful pod creation, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn created_pods(&self) -> Result<Vec<PodSpec>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.created.clone())
    }

    /// Number of successful creations of pod `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn create_count(&self, name: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.created.iter().filter(|spec| spec.name == name).count())
    }

    /// Names of pods deleted individually, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn deleted_pods(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.deleted.clone())
    }

    /// Number of pods currently present.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn live_pod_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.pods.len())
    }

    /// Number of volumes currently present.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn volume_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.volumes.len())
    }

    /// Highest number of pods simultaneously not yet observed terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn peak_active(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.peak_active)
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create_pod(&self, spec: &PodSpec) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;

        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(Error::cluster(format!(
                "injected create failure for {}",
                spec.name
            )));
        }
        if state.pods.contains_key(&spec.name) {
            return Err(Error::cluster(format!("pod {} already exists", spec.name)));
        }

        let script = state
            .scripts
            .get_mut(&spec.name)
            .and_then(VecDeque::pop_front)
            .filter(|script| !script.is_empty())
            .unwrap_or_else(|| self.default_script.clone());

        state.pods.insert(
            spec.name.clone(),
            PodEntry {
                spec: spec.clone(),
                script: script.into(),
                observed: PodStatus::pending(),
            },
        );
        state.created.push(spec.clone());

        let active = state.pods.values().filter(|pod| pod.is_active()).count();
        state.peak_active = state.peak_active.max(active);
        drop(state);
        Ok(())
    }

    async fn pod_status(&self, _namespace: &str, name: &str) -> Result<PodStatus> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(remaining) = state.fail_polls.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::cluster(format!("injected status failure for {name}")));
            }
        }

        let Some(pod) = state.pods.get_mut(name) else {
            return Err(Error::cluster(format!("pod {name} not found")));
        };

        let status = if pod.script.len() > 1 {
            pod.script.pop_front()
        } else {
            pod.script.front().cloned()
        }
        .unwrap_or_else(PodStatus::succeeded);

        pod.observed = status.clone();
        drop(state);
        Ok(status)
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.fail_deletes > 0 {
            state.fail_deletes -= 1;
            return Err(Error::cluster(format!("injected delete failure for {name}")));
        }
        state.delete_pod(name);
        state.deleted.push(name.to_string());
        drop(state);
        Ok(())
    }

    async fn delete_pods_by_label(&self, _namespace: &str, label: &str) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let matching: Vec<String> = state
            .pods
            .iter()
            .filter(|(name, pod)| {
                pod.spec.run_label() == Some(label) && !state.terminating_pods.contains_key(*name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &matching {
            state.delete_pod(name);
        }
        drop(state);
        Ok(matching.len())
    }

    async fn delete_volumes_by_label(&self, _namespace: &str, label: &str) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let matching: Vec<String> = state
            .volumes
            .iter()
            .filter(|(name, volume_label)| {
                *volume_label == label && !state.terminating_volumes.contains_key(*name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &matching {
            state.delete_volume(name);
        }
        drop(state);
        Ok(matching.len())
    }

    async fn count_by_label(&self, _namespace: &str, label: &str) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.advance_terminations();
        let pods = state
            .pods
            .values()
            .filter(|pod| pod.spec.run_label() == Some(label))
            .count();
        let volumes = state
            .volumes
            .values()
            .filter(|volume_label| *volume_label == label)
            .count();
        drop(state);
        Ok(pods + volumes)
    }
}

#[async_trait]
impl VolumeProvisioner for InMemoryCluster {
    async fn create_volumes_from_snapshot(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<VolumeHandle>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let count = request.count.saturating_sub(state.volume_shortfall);

        let handles: Vec<VolumeHandle> = (0..count)
            .map(|i| VolumeHandle::new(format!("{}-vol-{i}", request.run_id)))
            .collect();
        if let Some(taken) = handles
            .iter()
            .find(|handle| state.volumes.contains_key(handle.as_str()))
        {
            return Err(Error::cluster(format!("volume {taken} already exists")));
        }
        for handle in &handles {
            state
                .volumes
                .insert(handle.as_str().to_string(), request.label.clone());
        }
        drop(state);
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::RUN_LABEL_KEY;

    fn spec(name: &str, label: &str) -> PodSpec {
        PodSpec {
            name: name.to_string(),
            namespace: "ns".to_string(),
            image: "img".to_string(),
            labels: BTreeMap::from([(RUN_LABEL_KEY.to_string(), label.to_string())]),
            command: vec![],
            volume: VolumeHandle::new("vol-0"),
            mount_path: "/mnt".to_string(),
        }
    }

    #[tokio::test]
    async fn default_script_runs_then_succeeds() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&spec("a", "rv")).await.unwrap();

        let first = cluster.pod_status("ns", "a").await.unwrap();
        let second = cluster.pod_status("ns", "a").await.unwrap();
        let third = cluster.pod_status("ns", "a").await.unwrap();

        assert_eq!(first.phase, RemotePhase::Running);
        assert_eq!(second.phase, RemotePhase::Succeeded);
        assert_eq!(third.phase, RemotePhase::Succeeded);
    }

    #[tokio::test]
    async fn scripts_are_consumed_per_creation() {
        let cluster = InMemoryCluster::new();
        cluster.script_pod("a", vec![PodStatus::evicted()]);
        cluster.script_pod("a", vec![PodStatus::exited(2)]);

        cluster.create_pod(&spec("a", "rv")).await.unwrap();
        assert_eq!(
            cluster.pod_status("ns", "a").await.unwrap(),
            PodStatus::evicted()
        );

        cluster.delete_pod("ns", "a").await.unwrap();
        cluster.create_pod(&spec("a", "rv")).await.unwrap();
        assert_eq!(
            cluster.pod_status("ns", "a").await.unwrap().exit_code,
            Some(2)
        );
        assert_eq!(cluster.create_count("a").unwrap(), 2);
        assert_eq!(cluster.deleted_pods().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&spec("a", "rv")).await.unwrap();
        assert!(cluster.create_pod(&spec("a", "rv")).await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next_creates(1);
        assert!(cluster.create_pod(&spec("a", "rv")).await.is_err());
        cluster.create_pod(&spec("a", "rv")).await.unwrap();

        cluster.fail_status_polls("a", 1);
        assert!(cluster.pod_status("ns", "a").await.is_err());
        assert!(cluster.pod_status("ns", "a").await.is_ok());
    }

    #[tokio::test]
    async fn label_deletes_only_touch_matching_resources() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&spec("a", "rv-1")).await.unwrap();
        cluster.create_pod(&spec("b", "rv-2")).await.unwrap();
        let request = VolumeRequest {
            run_id: "rv-1".into(),
            snapshot_name: "snap".into(),
            namespace: "ns".into(),
            count: 3,
            label: "rv-1".into(),
        };
        let handles = cluster.create_volumes_from_snapshot(&request).await.unwrap();
        assert_eq!(handles.len(), 3);

        assert_eq!(cluster.delete_pods_by_label("ns", "rv-1").await.unwrap(), 1);
        assert_eq!(cluster.delete_volumes_by_label("ns", "rv-1").await.unwrap(), 3);
        assert_eq!(cluster.live_pod_count().unwrap(), 1);
        assert_eq!(cluster.volume_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_deletions_hold_names_until_observed() {
        let cluster = InMemoryCluster::new();
        cluster.delay_deletions(2);
        cluster.create_pod(&spec("a", "rv")).await.unwrap();
        let request = VolumeRequest {
            run_id: "rv".into(),
            snapshot_name: "snap".into(),
            namespace: "ns".into(),
            count: 1,
            label: "rv".into(),
        };
        cluster.create_volumes_from_snapshot(&request).await.unwrap();

        assert_eq!(cluster.delete_pods_by_label("ns", "rv").await.unwrap(), 1);
        assert_eq!(cluster.delete_volumes_by_label("ns", "rv").await.unwrap(), 1);
        assert!(cluster.create_pod(&spec("a", "rv")).await.is_err());
        assert!(cluster.create_volumes_from_snapshot(&request).await.is_err());

        assert_eq!(cluster.count_by_label("ns", "rv").await.unwrap(), 2);
        assert_eq!(cluster.count_by_label("ns", "rv").await.unwrap(), 0);
        cluster.create_pod(&spec("a", "rv")).await.unwrap();
        cluster.create_volumes_from_snapshot(&request).await.unwrap();
    }

    #[tokio::test]
    async fn injected_delete_failures_leave_the_pod() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&spec("a", "rv")).await.unwrap();
        cluster.fail_next_deletes(1);

        assert!(cluster.delete_pod("ns", "a").await.is_err());
        assert_eq!(cluster.live_pod_count().unwrap(), 1);
        cluster.delete_pod("ns", "a").await.unwrap();
        assert_eq!(cluster.live_pod_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn peak_active_ignores_observed_terminal_pods() {
        let cluster = InMemoryCluster::with_default_script(vec![PodStatus::succeeded()]);
        cluster.create_pod(&spec("a", "rv")).await.unwrap();
        cluster.pod_status("ns", "a").await.unwrap();
        cluster.create_pod(&spec("b", "rv")).await.unwrap();
        assert_eq!(cluster.peak_active().unwrap(), 1);
    }
}
