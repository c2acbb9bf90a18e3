//! Cluster backend selection.

use std::sync::Arc;

use anyhow::Result;

use replay_verify::cluster::memory::InMemoryCluster;
use replay_verify::cluster::{ClusterClient, VolumeProvisioner};

use crate::Config;

/// Cluster collaborators handed to the scheduler.
pub struct ClusterHandles {
    /// Pod API.
    pub cluster: Arc<dyn ClusterClient>,
    /// Volume API.
    pub provisioner: Arc<dyn VolumeProvisioner>,
}

impl std::fmt::Debug for ClusterHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandles").finish_non_exhaustive()
    }
}

/// Connects to the configured cluster, or an in-memory one for dry runs.
///
/// # Errors
///
/// Returns an error if the API URL is missing or the client cannot be built,
/// or if the binary was built without the `kube` feature.
pub fn connect(config: &Config, dry_run: bool) -> Result<ClusterHandles> {
    if dry_run {
        tracing::info!("dry run: using the in-memory cluster");
        let memory = Arc::new(InMemoryCluster::new());
        return Ok(ClusterHandles {
            cluster: memory.clone(),
            provisioner: memory,
        });
    }
    connect_kube(config)
}

#[cfg(feature = "kube")]
fn connect_kube(config: &Config) -> Result<ClusterHandles> {
    use anyhow::Context;
    use replay_verify::cluster::kube::{KubeClient, KubeConfig};

    let api_url = config
        .kube_api_url
        .as_ref()
        .context("Kubernetes API URL is required. Set REPLAY_VERIFY_KUBE_API_URL or use --kube-api-url")?;

    let mut kube_config = KubeConfig::new(api_url).with_insecure_tls(config.insecure_tls);
    if let Some(token) = &config.kube_token {
        kube_config = kube_config.with_bearer_token(token);
    }
    if let Some(storage_class) = &config.storage_class {
        kube_config = kube_config.with_storage_class(storage_class);
    }

    let client = Arc::new(KubeClient::new(kube_config).context("failed to create Kubernetes client")?);
    Ok(ClusterHandles {
        cluster: client.clone(),
        provisioner: client,
    })
}

#[cfg(not(feature = "kube"))]
fn connect_kube(_config: &Config) -> Result<ClusterHandles> {
    anyhow::bail!("built without the `kube` feature; only --dry-run is available")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_needs_no_api_url() {
        assert!(connect(&Config::default(), true).is_ok());
    }

    #[cfg(feature = "kube")]
    #[test]
    fn live_run_needs_api_url() {
        let err = connect(&Config::default(), false).unwrap_err();
        assert!(err.to_string().contains("REPLAY_VERIFY_KUBE_API_URL"));
    }
}
