use crate::operator::crd::{TargetRefKind, UrlPerformance, UrlPerformanceStatus};
use crate::operator::TargetResolver;
use crate::{OfficerError, Result};
use async_trait::async_trait;
use futures::io::AsyncBufReadExt;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{
    ApiResource, DynamicObject, GroupVersionKind, ListParams, LogParams, Patch, PatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Deadline for pod discovery and log stream opens
pub const API_TIMEOUT: Duration = Duration::from_secs(15);

/// Lines of a followed container log
pub type LogLines = BoxStream<'static, std::io::Result<String>>;

#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Connect using an explicit kubeconfig and/or context, falling back to
    /// the in-cluster or default configuration
    pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };

        let config = match (kubeconfig, context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    OfficerError::KubernetesError(format!(
                        "Failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        OfficerError::KubernetesError(format!("Invalid kubeconfig: {}", e))
                    })?
            }
            (None, Some(_)) => Config::from_kubeconfig(&options).await.map_err(|e| {
                OfficerError::KubernetesError(format!("Invalid kubeconfig: {}", e))
            })?,
            (None, None) => Config::infer().await.map_err(|e| {
                OfficerError::KubernetesError(format!("Failed to infer K8s config: {}", e))
            })?,
        };

        let client = Client::try_from(config).map_err(|e| {
            OfficerError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Kubernetes client ready");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Namespace of the current kubeconfig context or service account
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn url_performances(&self, namespace: &str) -> Api<UrlPerformance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn url_performances_all(&self) -> Api<UrlPerformance> {
        Api::all(self.client.clone())
    }

    pub fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        let pods = self.pods(namespace);

        let list = with_deadline("list pods", pods.list(&params))
            .await?
            .map_err(|e| {
                OfficerError::KubernetesError(format!(
                    "Failed to list pods in {} ({}): {}",
                    namespace, label_selector, e
                ))
            })?;

        Ok(list.items)
    }

    /// Follow the log of one container, starting now
    pub async fn follow_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<LogLines> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            since_time: Some(chrono::Utc::now()),
            ..Default::default()
        };

        let pods = self.pods(namespace);
        let reader = with_deadline("open log stream", pods.log_stream(pod, &params))
            .await?
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 404 => OfficerError::PodNotFound {
                    name: pod.to_string(),
                    namespace: namespace.to_string(),
                },
                other => OfficerError::LogSourceError(format!(
                    "Failed to open log stream for {}/{}: {}",
                    namespace, pod, other
                )),
            })?;

        Ok(reader.lines().boxed())
    }

    pub async fn patch_url_performance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &UrlPerformanceStatus,
    ) -> Result<()> {
        let patch = Patch::Merge(json!({ "status": status }));
        self.url_performances(namespace)
            .patch_status(name, &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }

    async fn ingress_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn ingress_route_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let gvk = GroupVersionKind::gvk("traefik.io", "v1alpha1", "IngressRoute");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        Ok(api.get_opt(name).await?.is_some())
    }
}

#[async_trait]
impl TargetResolver for K8sClient {
    async fn target_exists(&self, kind: TargetRefKind, namespace: &str, name: &str) -> Result<bool> {
        match kind {
            TargetRefKind::Ingress => self.ingress_exists(namespace, name).await,
            TargetRefKind::IngressRoute => self.ingress_route_exists(namespace, name).await,
        }
    }
}

async fn with_deadline<F: Future>(operation: &str, fut: F) -> Result<F::Output> {
    tokio::time::timeout(API_TIMEOUT, fut)
        .await
        .map_err(|_| OfficerError::Timeout {
            operation: operation.to_string(),
            seconds: API_TIMEOUT.as_secs(),
        })
}
