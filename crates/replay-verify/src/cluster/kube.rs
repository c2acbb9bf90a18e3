//! Kubernetes REST API cluster implementation.
//!
//! This module provides [`KubeClient`], an implementation of [`ClusterClient`]
//! and [`VolumeProvisioner`] that talks to the Kubernetes API server directly
//! over HTTP.
//!
//! ## Features
//!
//! - **Pods**: `/api/v1/namespaces/{ns}/pods`, one pod per replay range,
//!   `restartPolicy: Never`
//! - **Volumes**: `/api/v1/namespaces/{ns}/persistentvolumeclaims`, cloned
//!   from a `VolumeSnapshot` and mounted read-only
//! - **Teardown**: label-selector collection deletes on `run=<label>`
//!
//! The client does no credential discovery; it sends an already-issued bearer
//! token if one is configured.
//!
//! ## Usage
//!
//! This module is only compiled when the `kube` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! replay-verify = { version = "0.1", features = ["kube"] }
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use replay_verify::cluster::kube::{KubeClient, KubeConfig};
//!
//! let config = KubeConfig::new("https://10.0.0.1:6443")
//!     .with_bearer_token(std::env::var("KUBE_TOKEN")?)
//!     .with_storage_class("premium-rwo");
//!
//! let client = KubeClient::new(config)?;
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    ClusterClient, PodSpec, PodStatus, RUN_LABEL_KEY, RemotePhase, VolumeHandle,
    VolumeProvisioner, VolumeRequest,
};
use crate::error::{Error, Result};

/// Name of the replay container inside each worker pod.
pub const CONTAINER_NAME: &str = "replay-verify";

/// Name of the snapshot volume inside each worker pod.
const VOLUME_NAME: &str = "archive";

/// Configuration for the Kubernetes client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// API server base URL (e.g. `https://10.0.0.1:6443`).
    pub api_server: String,
    /// Pre-issued bearer token.
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    /// Storage class for cloned volumes; the cluster default if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Requested size of each cloned volume (e.g. `10Ti`).
    #[serde(default = "default_volume_size")]
    pub volume_size: String,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Skips TLS verification of the API server certificate.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_volume_size() -> String {
    "10Ti".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl KubeConfig {
    /// Creates a config for the API server at `api_server`.
    #[must_use]
    pub fn new(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            bearer_token: None,
            storage_class: None,
            volume_size: default_volume_size(),
            request_timeout: default_request_timeout(),
            accept_invalid_certs: false,
        }
    }

    /// Sets the bearer token sent with every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Sets the storage class for cloned volumes.
    #[must_use]
    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    /// Sets the requested size of each cloned volume.
    #[must_use]
    pub fn with_volume_size(mut self, size: impl Into<String>) -> Self {
        self.volume_size = size.into();
        self
    }

    /// Skips TLS verification (for self-signed development clusters).
    #[must_use]
    pub const fn with_insecure_tls(mut self, accept_invalid_certs: bool) -> Self {
        self.accept_invalid_certs = accept_invalid_certs;
        self
    }
}

/// Kubernetes API client.
pub struct KubeClient {
    config: KubeConfig,
    client: reqwest::Client,
}

// Manual Debug implementation so the bearer token never reaches logs
impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("api_server", &self.config.api_server)
            .field("bearer_token", &self.config.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("storage_class", &self.config.storage_class)
            .finish_non_exhaustive()
    }
}

/// Kubernetes `Status` object returned on API errors.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

/// Subset of a `Pod` resource needed to classify it.
#[derive(Debug, Deserialize)]
struct PodResource {
    #[serde(default)]
    status: PodStatusBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusBody {
    phase: Option<String>,
    reason: Option<String>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    name: String,
    #[serde(default)]
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerState {
    terminated: Option<TerminatedState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminatedState {
    exit_code: i32,
    reason: Option<String>,
}

/// Any list response; only the item count matters.
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<Value>,
}

impl KubeClient {
    /// Creates a new Kubernetes client.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The API server URL is empty
    /// - The HTTP client cannot be built
    pub fn new(config: KubeConfig) -> Result<Self> {
        if config.api_server.is_empty() {
            return Err(Error::configuration("api_server cannot be empty"));
        }
        if config.request_timeout.is_zero() {
            return Err(Error::configuration(
                "request_timeout must be greater than zero",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn url(&self, namespace: &str, resource: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{namespace}/{resource}",
            self.config.api_server.trim_end_matches('/')
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::cluster_with_source(format!("{what} request failed"), e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(api_error(what, status, &body))
    }

    async fn delete_collection(&self, namespace: &str, resource: &str, label: &str) -> Result<usize> {
        let request = self
            .client
            .delete(self.url(namespace, resource))
            .query(&[("labelSelector", label_selector(label))]);
        let response = self.send(request, &format!("delete {resource}")).await?;
        let list: ListResponse = response.json().await.map_err(|e| {
            Error::cluster_with_source(format!("malformed {resource} delete response"), e)
        })?;
        Ok(list.items.len())
    }

    async fn count_collection(&self, namespace: &str, resource: &str, label: &str) -> Result<usize> {
        let request = self
            .client
            .get(self.url(namespace, resource))
            .query(&[("labelSelector", label_selector(label))]);
        let response = self.send(request, &format!("list {resource}")).await?;
        let list: ListResponse = response.json().await.map_err(|e| {
            Error::cluster_with_source(format!("malformed {resource} list response"), e)
        })?;
        Ok(list.items.len())
    }
}

fn label_selector(label: &str) -> String {
    format!("{RUN_LABEL_KEY}={label}")
}

fn api_error(what: &str, status: reqwest::StatusCode, body: &str) -> Error {
    match serde_json::from_str::<ApiStatus>(body) {
        Ok(api) if !api.message.is_empty() => {
            Error::cluster(format!("{what} failed: {} ({})", api.message, api.reason))
        }
        _ => Error::cluster(format!("{what} failed: {status} - {body}")),
    }
}

/// Builds the `Pod` manifest for a launch spec.
fn pod_manifest(spec: &PodSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels,
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": CONTAINER_NAME,
                "image": spec.image,
                "command": spec.command,
                "volumeMounts": [{
                    "name": VOLUME_NAME,
                    "mountPath": spec.mount_path,
                    "readOnly": true,
                }],
            }],
            "volumes": [{
                "name": VOLUME_NAME,
                "persistentVolumeClaim": {
                    "claimName": spec.volume.as_str(),
                    "readOnly": true,
                },
            }],
        },
    })
}

/// Builds the `PersistentVolumeClaim` manifest for one snapshot clone.
fn volume_manifest(config: &KubeConfig, request: &VolumeRequest, name: &str) -> Value {
    let labels = BTreeMap::from([(RUN_LABEL_KEY, request.label.as_str())]);
    let mut manifest = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "namespace": request.namespace,
            "labels": labels,
        },
        "spec": {
            "accessModes": ["ReadOnlyMany"],
            "resources": { "requests": { "storage": config.volume_size } },
            "dataSource": {
                "apiGroup": "snapshot.storage.k8s.io",
                "kind": "VolumeSnapshot",
                "name": request.snapshot_name,
            },
        },
    });
    if let Some(class) = &config.storage_class {
        manifest["spec"]["storageClassName"] = json!(class);
    }
    manifest
}

/// Extracts the raw status the pod module classifies.
fn parse_pod_status(resource: PodResource) -> PodStatus {
    let status = resource.status;
    let terminated = status
        .container_statuses
        .into_iter()
        .find(|container| container.name == CONTAINER_NAME)
        .and_then(|container| container.state.terminated);

    PodStatus {
        phase: status
            .phase
            .as_deref()
            .map_or(RemotePhase::Unknown, RemotePhase::from_api),
        reason: status
            .reason
            .or_else(|| terminated.as_ref().and_then(|t| t.reason.clone())),
        exit_code: terminated.map(|t| t.exit_code),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn create_pod(&self, spec: &PodSpec) -> Result<()> {
        let request = self
            .client
            .post(self.url(&spec.namespace, "pods"))
            .json(&pod_manifest(spec));
        self.send(request, &format!("create pod {}", spec.name)).await?;
        Ok(())
    }

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        let request = self
            .client
            .get(format!("{}/{name}", self.url(namespace, "pods")));
        let response = self.send(request, &format!("get pod {name}")).await?;
        let resource: PodResource = response
            .json()
            .await
            .map_err(|e| Error::cluster_with_source(format!("malformed pod {name}"), e))?;
        Ok(parse_pod_status(resource))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let response = self
            .authorize(
                self.client
                    .delete(format!("{}/{name}", self.url(namespace, "pods"))),
            )
            .send()
            .await
            .map_err(|e| Error::cluster_with_source(format!("delete pod {name} request failed"), e))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(api_error(&format!("delete pod {name}"), status, &body))
    }

    async fn delete_pods_by_label(&self, namespace: &str, label: &str) -> Result<usize> {
        self.delete_collection(namespace, "pods", label).await
    }

    async fn delete_volumes_by_label(&self, namespace: &str, label: &str) -> Result<usize> {
        self.delete_collection(namespace, "persistentvolumeclaims", label)
            .await
    }

    async fn count_by_label(&self, namespace: &str, label: &str) -> Result<usize> {
        // Terminating objects are still listed until their finalizers run.
        let pods = self.count_collection(namespace, "pods", label).await?;
        let volumes = self
            .count_collection(namespace, "persistentvolumeclaims", label)
            .await?;
        Ok(pods + volumes)
    }
}

#[async_trait]
impl VolumeProvisioner for KubeClient {
    async fn create_volumes_from_snapshot(
        &self,
        request: &VolumeRequest,
    ) -> Result<Vec<VolumeHandle>> {
        let url = self.url(&request.namespace, "persistentvolumeclaims");
        let mut handles = Vec::with_capacity(request.count);

        for i in 0..request.count {
            let name = format!("{}-vol-{i}", request.run_id);
            let manifest = volume_manifest(&self.config, request, &name);
            self.send(
                self.client.post(&url).json(&manifest),
                &format!("create volume {name}"),
            )
            .await?;
            tracing::debug!(volume = %name, snapshot = %request.snapshot_name, "volume claim created");
            handles.push(VolumeHandle::new(name));
        }

        Ok(handles)
    }
}
