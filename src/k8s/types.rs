use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// The parts of a Traefik pod the log source needs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    /// Readiness of the container whose log is followed
    pub container_ready: bool,
}

impl PodInfo {
    pub fn from_k8s_pod(pod: &Pod, container: &str) -> Self {
        let metadata = &pod.metadata;
        let status = pod.status.as_ref();

        let container_ready = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|cs| cs.name == container))
            .map(|cs| cs.ready)
            .unwrap_or(false);

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata.namespace.clone().unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            container_ready,
        }
    }

    /// Running with the followed container ready
    pub fn is_streamable(&self) -> bool {
        !self.name.is_empty() && self.phase == "Running" && self.container_ready
    }
}
