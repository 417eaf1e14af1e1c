//! Container orchestrator client.
//!
//! [`Cluster`] is the narrow surface the controllers need. [`KubeClient`]
//! implements it against the Kubernetes REST API with plain `reqwest` calls.
//! Lookups return `Ok(None)` for absent objects and deletes return
//! `Ok(false)`; errors are reserved for infrastructure failures.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::manifests::{DeploymentManifest, IngressRouteManifest, JobManifest, ServiceManifest};
use crate::config::ClusterSection;
use crate::errors::{WorkersError, WorkersResult};

const SERVICE: &str = "kubernetes";

/// Live view of a long-running workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadState {
    pub created_at: Option<DateTime<Utc>>,
    pub ready_replicas: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceState {
    pub created_at: Option<DateTime<Utc>>,
    /// True once an external load-balancer address has been assigned.
    pub has_external_address: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteState {
    pub created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_job(&self, manifest: &JobManifest) -> WorkersResult<()>;
    async fn create_deployment(&self, manifest: &DeploymentManifest) -> WorkersResult<()>;
    async fn create_service(&self, manifest: &ServiceManifest) -> WorkersResult<()>;
    async fn create_ingress_route(&self, manifest: &IngressRouteManifest) -> WorkersResult<()>;

    async fn get_deployment(&self, name: &str) -> WorkersResult<Option<WorkloadState>>;
    async fn get_service(&self, name: &str) -> WorkersResult<Option<ServiceState>>;
    async fn get_ingress_route(&self, name: &str) -> WorkersResult<Option<RouteState>>;

    async fn delete_deployment(&self, name: &str) -> WorkersResult<bool>;
    async fn delete_service(&self, name: &str) -> WorkersResult<bool>;
    async fn delete_ingress_route(&self, name: &str) -> WorkersResult<bool>;

    /// Key names stored in secret `name`, or `None` if there is no such secret.
    async fn secret_keys(&self, name: &str) -> WorkersResult<Option<Vec<String>>>;
}

// ── Wire views ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectView<S> {
    #[serde(default)]
    metadata: MetaView,
    status: Option<S>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaView {
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatusView {
    #[serde(default)]
    ready_replicas: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStatusView {
    #[serde(default)]
    load_balancer: Option<LoadBalancerView>,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerView {
    #[serde(default)]
    ingress: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SecretView {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteOptions {
    propagation_policy: &'static str,
}

fn workload_state(view: ObjectView<DeploymentStatusView>) -> WorkloadState {
    WorkloadState {
        created_at: view.metadata.creation_timestamp,
        ready_replicas: view.status.and_then(|s| s.ready_replicas).unwrap_or(0),
    }
}

fn service_state(view: ObjectView<ServiceStatusView>) -> ServiceState {
    let has_external_address = view
        .status
        .and_then(|s| s.load_balancer)
        .is_some_and(|lb| !lb.ingress.is_empty());
    ServiceState {
        created_at: view.metadata.creation_timestamp,
        has_external_address,
    }
}

// ── REST client ───────────────────────────────────────────────────────

pub struct KubeClient {
    http: reqwest::Client,
    api_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubeClient {
    /// Build a client from config. The bearer token comes from `KUBE_TOKEN`
    /// or, failing that, the mounted service-account token file.
    pub fn new(config: &ClusterSection) -> anyhow::Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        if let Some(ca_path) = config.ca_cert_path.as_ref().filter(|p| p.exists()) {
            let pem = std::fs::read(ca_path)
                .with_context(|| format!("Failed to read {}", ca_path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid CA certificate {}", ca_path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let token = match &config.token {
            Some(token) => Some(token.clone()),
            None => match config.token_path.as_ref().filter(|p| p.exists()) {
                Some(path) => Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read {}", path.display()))?
                        .trim()
                        .to_string(),
                ),
                None => None,
            },
        };

        Ok(Self {
            http: builder.build().context("Failed to build Kubernetes client")?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token,
        })
    }

    fn url(&self, group_path: &str, resource: &str, name: Option<&str>) -> String {
        let base = format!(
            "{}/{}/namespaces/{}/{}",
            self.api_url, group_path, self.namespace, resource
        );
        match name {
            Some(name) => format!("{}/{}", base, name),
            None => base,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn create<T: Serialize + Sync>(&self, url: String, body: &T) -> WorkersResult<()> {
        debug!(url = %url, "POST");
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(body)
            .send()
            .await
            .map_err(|e| WorkersError::from_transport(SERVICE, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(WorkersError::from_status(SERVICE, status, &body))
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> WorkersResult<Option<T>> {
        debug!(url = %url, "GET");
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| WorkersError::from_transport(SERVICE, e))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkersError::from_status(SERVICE, status, &body));
        }
        let value = resp
            .json::<T>()
            .await
            .context("Failed to parse Kubernetes response")?;
        Ok(Some(value))
    }

    async fn delete(&self, url: String) -> WorkersResult<bool> {
        debug!(url = %url, "DELETE");
        let resp = self
            .request(reqwest::Method::DELETE, &url)
            .json(&DeleteOptions {
                propagation_policy: "Foreground",
            })
            .send()
            .await
            .map_err(|e| WorkersError::from_transport(SERVICE, e))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkersError::from_status(SERVICE, status, &body));
        }
        Ok(true)
    }
}

const BATCH: &str = "apis/batch/v1";
const APPS: &str = "apis/apps/v1";
const CORE: &str = "api/v1";
const TRAEFIK: &str = "apis/traefik.containo.us/v1alpha1";

#[async_trait]
impl Cluster for KubeClient {
    async fn create_job(&self, manifest: &JobManifest) -> WorkersResult<()> {
        self.create(self.url(BATCH, "jobs", None), manifest).await
    }

    async fn create_deployment(&self, manifest: &DeploymentManifest) -> WorkersResult<()> {
        self.create(self.url(APPS, "deployments", None), manifest)
            .await
    }

    async fn create_service(&self, manifest: &ServiceManifest) -> WorkersResult<()> {
        self.create(self.url(CORE, "services", None), manifest).await
    }

    async fn create_ingress_route(&self, manifest: &IngressRouteManifest) -> WorkersResult<()> {
        self.create(self.url(TRAEFIK, "ingressroutes", None), manifest)
            .await
    }

    async fn get_deployment(&self, name: &str) -> WorkersResult<Option<WorkloadState>> {
        let view: Option<ObjectView<DeploymentStatusView>> =
            self.get(self.url(APPS, "deployments", Some(name))).await?;
        Ok(view.map(workload_state))
    }

    async fn get_service(&self, name: &str) -> WorkersResult<Option<ServiceState>> {
        let view: Option<ObjectView<ServiceStatusView>> =
            self.get(self.url(CORE, "services", Some(name))).await?;
        Ok(view.map(service_state))
    }

    async fn get_ingress_route(&self, name: &str) -> WorkersResult<Option<RouteState>> {
        let view: Option<ObjectView<serde_json::Value>> =
            self.get(self.url(TRAEFIK, "ingressroutes", Some(name))).await?;
        Ok(view.map(|v| RouteState {
            created_at: v.metadata.creation_timestamp,
        }))
    }

    async fn delete_deployment(&self, name: &str) -> WorkersResult<bool> {
        self.delete(self.url(APPS, "deployments", Some(name))).await
    }

    async fn delete_service(&self, name: &str) -> WorkersResult<bool> {
        self.delete(self.url(CORE, "services", Some(name))).await
    }

    async fn delete_ingress_route(&self, name: &str) -> WorkersResult<bool> {
        self.delete(self.url(TRAEFIK, "ingressroutes", Some(name)))
            .await
    }

    async fn secret_keys(&self, name: &str) -> WorkersResult<Option<Vec<String>>> {
        let secret: Option<SecretView> = self.get(self.url(CORE, "secrets", Some(name))).await?;
        Ok(secret.map(|s| s.data.into_keys().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KubeClient {
        let config = ClusterSection {
            api_url: "https://k8s.example.com/".into(),
            namespace: "studio".into(),
            token_path: None,
            ca_cert_path: None,
            token: Some("t0ken".into()),
            ..ClusterSection::default()
        };
        KubeClient::new(&config).unwrap()
    }

    #[test]
    fn test_urls() {
        let client = client();
        assert_eq!(
            client.url(BATCH, "jobs", None),
            "https://k8s.example.com/apis/batch/v1/namespaces/studio/jobs"
        );
        assert_eq!(
            client.url(TRAEFIK, "ingressroutes", Some("a-b-c")),
            "https://k8s.example.com/apis/traefik.containo.us/v1alpha1/namespaces/studio/ingressroutes/a-b-c"
        );
        assert_eq!(client.token.as_deref(), Some("t0ken"));
    }

    #[test]
    fn test_token_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "file-token\n").unwrap();
        let config = ClusterSection {
            token_path: Some(path),
            ca_cert_path: None,
            token: None,
            ..ClusterSection::default()
        };
        let client = KubeClient::new(&config).unwrap();
        assert_eq!(client.token.as_deref(), Some("file-token"));
    }

    #[test]
    fn test_deployment_view_ready_replicas() {
        let json = serde_json::json!({
            "metadata": {"name": "x", "creationTimestamp": "2021-09-01T12:00:00Z"},
            "status": {"replicas": 1, "readyReplicas": 1}
        });
        let view: ObjectView<DeploymentStatusView> = serde_json::from_value(json).unwrap();
        let state = workload_state(view);
        assert_eq!(state.ready_replicas, 1);
        assert!(state.created_at.is_some());
    }

    #[test]
    fn test_deployment_view_without_status() {
        let json = serde_json::json!({"metadata": {"name": "x"}});
        let view: ObjectView<DeploymentStatusView> = serde_json::from_value(json).unwrap();
        let state = workload_state(view);
        assert_eq!(state.ready_replicas, 0);
        assert!(state.created_at.is_none());
    }

    #[test]
    fn test_service_view_load_balancer() {
        let pending = serde_json::json!({
            "metadata": {"creationTimestamp": "2021-09-01T12:00:00Z"},
            "status": {"loadBalancer": {}}
        });
        let view: ObjectView<ServiceStatusView> = serde_json::from_value(pending).unwrap();
        assert!(!service_state(view).has_external_address);

        let assigned = serde_json::json!({
            "metadata": {"creationTimestamp": "2021-09-01T12:00:00Z"},
            "status": {"loadBalancer": {"ingress": [{"ip": "34.1.2.3"}]}}
        });
        let view: ObjectView<ServiceStatusView> = serde_json::from_value(assigned).unwrap();
        assert!(service_state(view).has_external_address);
    }

    #[test]
    fn test_secret_view_keys() {
        let json = serde_json::json!({"data": {"API_KEY": "c2VjcmV0", "DB_URL": "eA=="}});
        let view: SecretView = serde_json::from_value(json).unwrap();
        let keys: Vec<_> = view.data.into_keys().collect();
        assert_eq!(keys, vec!["API_KEY", "DB_URL"]);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_transient() {
        let config = ClusterSection {
            api_url: "http://127.0.0.1:1".into(),
            token_path: None,
            ca_cert_path: None,
            timeout_secs: 2,
            ..ClusterSection::default()
        };
        let client = KubeClient::new(&config).unwrap();
        let err = client.get_deployment("missing").await.unwrap_err();
        assert!(err.is_transient());
    }
}
