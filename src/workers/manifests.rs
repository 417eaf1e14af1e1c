//! Typed orchestrator objects and the builder that produces them.
//!
//! Every object is a plain serde struct serialized in the orchestrator's
//! camelCase wire format. Nothing is assembled from loosely typed maps.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::models::{Job, Project, TechKind};
use super::resources::ResourceSizing;
use crate::errors::{WorkersError, WorkersResult};

/// Port every interactive app listens on inside its container.
pub const VIZ_PORT: u16 = 8010;
/// Maximum length of an orchestrator object name.
pub const MAX_NAME_LEN: usize = 63;

const HASH_SUFFIX_LEN: usize = 8;

/// Env vars the service sets on workloads itself. Secrets may not shadow them.
pub const RESERVED_ENV: &[&str] = &["JOB_ID", "TASK_NAME", "CALLBACK_URL", "URL_BASE_PATHNAME"];

// ── Names ─────────────────────────────────────────────────────────────

/// Join `parts` into a DNS-safe object name.
///
/// Lowercases, collapses runs of non-alphanumerics to a single `-`, and
/// trims dashes from both ends. Names over [`MAX_NAME_LEN`] are truncated and
/// suffixed with a short digest of the untruncated name.
pub fn dns_name(parts: &[&str]) -> String {
    let slug = parts
        .iter()
        .flat_map(|p| p.split(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() <= MAX_NAME_LEN {
        return slug;
    }
    let digest = hex::encode(Sha256::digest(slug.as_bytes()));
    let keep = MAX_NAME_LEN - HASH_SUFFIX_LEN - 1;
    format!(
        "{}-{}",
        slug[..keep].trim_end_matches('-'),
        &digest[..HASH_SUFFIX_LEN]
    )
}

/// Name shared by the workload, service and route of a deployment.
pub fn deployment_name(project: &Project, deployment: &str) -> String {
    dns_name(&[&project.owner, &project.title, deployment])
}

pub fn job_name(job: &Job) -> String {
    dns_name(&[&job.task_name, &job.id.to_string()])
}

/// Name of the orchestrator secret holding a project's credentials.
pub fn secret_name(project: &Project) -> String {
    dns_name(&[&project.owner, &project.title, "secret"])
}

/// Path prefix an interactive deployment is served under.
pub fn url_prefix(project: &Project, deployment: &str) -> String {
    format!("/{}/{}/{}", project.owner, project.title, deployment)
}

// ── Object model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: SecretKeySelector,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    /// Reference to `key` in secret `secret`; the orchestrator resolves it at start.
    pub fn from_secret(secret: &str, key: &str) -> Self {
        Self {
            name: key.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: SecretKeySelector {
                    name: secret.to_string(),
                    key: key.to_string(),
                },
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Quantities {
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceRequirements {
    pub requests: Quantities,
    pub limits: Quantities,
}

impl From<&ResourceSizing> for ResourceRequirements {
    fn from(sizing: &ResourceSizing) -> Self {
        let (cpu, memory) = sizing.requests.quantities();
        let requests = Quantities { cpu, memory };
        let (cpu, memory) = sizing.limits.quantities();
        let limits = Quantities { cpu, memory };
        Self { requests, limits }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub container_port: u16,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    Always,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<Container>,
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    pub metadata: TemplateMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TemplateMeta {
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub backoff_limit: u32,
    pub ttl_seconds_after_finished: u32,
    pub template: PodTemplate,
}

/// One-shot workload. Never restarted, cleaned up as soon as it finishes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub selector: LabelSelector,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub port: u16,
    pub target_port: u16,
    pub protocol: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub service_type: &'static str,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteService {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Route {
    #[serde(rename = "match")]
    pub match_rule: String,
    pub kind: &'static str,
    pub services: Vec<RouteService>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRouteSpec {
    pub entry_points: Vec<String>,
    pub routes: Vec<Route>,
}

/// Host + path-prefix route to a deployment's service.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRouteManifest {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: IngressRouteSpec,
}

/// The three objects backing one interactive deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct VizObjects {
    pub deployment: DeploymentManifest,
    pub service: ServiceManifest,
    pub route: IngressRouteManifest,
}

// ── Commands ──────────────────────────────────────────────────────────

/// Command line that serves an interactive app of kind `tech`.
pub fn viz_command(
    tech: TechKind,
    callable: &str,
    prefix: &str,
    viz_host: &str,
) -> WorkersResult<Vec<String>> {
    let port = VIZ_PORT.to_string();
    match tech {
        TechKind::DashApp => Ok(vec![
            "gunicorn".into(),
            "--bind".into(),
            format!("0.0.0.0:{}", port),
            callable.into(),
        ]),
        TechKind::BokehApp => Ok(vec![
            "bokeh".into(),
            "serve".into(),
            callable.into(),
            "--address".into(),
            "0.0.0.0".into(),
            "--port".into(),
            port,
            "--prefix".into(),
            prefix.into(),
            format!("--allow-websocket-origin={}", viz_host),
        ]),
        TechKind::Batch => Err(WorkersError::BadRequest(
            "batch projects cannot be deployed as interactive apps".into(),
        )),
    }
}

fn job_command(job: &Job) -> Vec<String> {
    vec![
        "csw".into(),
        "job".into(),
        "--job-id".into(),
        job.id.to_string(),
        "--route-name".into(),
        job.task_name.clone(),
    ]
}

// ── Builder ───────────────────────────────────────────────────────────

/// Cluster-wide settings every object depends on.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    pub namespace: String,
    pub image_registry: String,
    /// Public base URL of this service, used for job callbacks.
    pub public_url: String,
    pub viz_host: String,
}

impl SpecBuilder {
    pub fn image(&self, project: &Project, tag: &str) -> String {
        let repo = format!(
            "{}_{}_tasks",
            project.owner.to_ascii_lowercase(),
            project.title.to_ascii_lowercase()
        );
        let registry = self.image_registry.trim_end_matches('/');
        if registry.is_empty() {
            format!("{}:{}", repo, tag)
        } else {
            format!("{}/{}:{}", registry, repo, tag)
        }
    }

    pub fn callback_url(&self, job: &Job) -> String {
        format!(
            "{}/jobs/callback/{}/",
            self.public_url.trim_end_matches('/'),
            job.id
        )
    }

    fn meta(&self, name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: name.to_string(),
            namespace: self.namespace.clone(),
            labels: labels.clone(),
        }
    }

    /// One-shot workload running `job` against `project`'s image.
    pub fn job(
        &self,
        job: &Job,
        project: &Project,
        sizing: &ResourceSizing,
        secrets: Vec<EnvVar>,
    ) -> JobManifest {
        let name = job_name(job);
        let labels = labels(&[
            ("app", "job"),
            ("owner", dns_name(&[&project.owner]).as_str()),
            ("title", dns_name(&[&project.title]).as_str()),
            ("task", dns_name(&[&job.task_name]).as_str()),
        ]);

        let mut env = vec![
            EnvVar::literal("JOB_ID", job.id.to_string()),
            EnvVar::literal("TASK_NAME", job.task_name.clone()),
            EnvVar::literal("CALLBACK_URL", self.callback_url(job)),
        ];
        env.extend(secrets);

        JobManifest {
            api_version: "batch/v1",
            kind: "Job",
            metadata: self.meta(&name, &labels),
            spec: JobSpec {
                backoff_limit: 0,
                ttl_seconds_after_finished: 0,
                template: PodTemplate {
                    metadata: TemplateMeta {
                        labels: labels.clone(),
                    },
                    spec: PodSpec {
                        containers: vec![Container {
                            name,
                            image: self.image(project, &job.tag),
                            command: job_command(job),
                            env,
                            resources: sizing.into(),
                            ports: Vec::new(),
                        }],
                        restart_policy: RestartPolicy::Never,
                    },
                },
            },
        }
    }

    /// Workload, service and route for interactive deployment `deployment`.
    pub fn viz(
        &self,
        project: &Project,
        deployment: &str,
        tag: &str,
        sizing: &ResourceSizing,
        secrets: Vec<EnvVar>,
    ) -> WorkersResult<VizObjects> {
        let name = deployment_name(project, deployment);
        let prefix = url_prefix(project, deployment);
        let callable = project
            .callable_name
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                WorkersError::BadRequest(format!(
                    "{} does not declare a callable to serve",
                    project.full_name()
                ))
            })?;
        let command = viz_command(project.tech, callable, &prefix, &self.viz_host)?;

        let mut env = Vec::new();
        if project.tech == TechKind::DashApp {
            env.push(EnvVar::literal("URL_BASE_PATHNAME", format!("{}/", prefix)));
        }
        env.extend(secrets);

        let selector = labels(&[("app", name.as_str())]);
        let all_labels = labels(&[
            ("app", name.as_str()),
            ("owner", dns_name(&[&project.owner]).as_str()),
            ("title", dns_name(&[&project.title]).as_str()),
        ]);

        let deployment_manifest = DeploymentManifest {
            api_version: "apps/v1",
            kind: "Deployment",
            metadata: self.meta(&name, &all_labels),
            spec: DeploymentSpec {
                replicas: 1,
                selector: LabelSelector {
                    match_labels: selector.clone(),
                },
                template: PodTemplate {
                    metadata: TemplateMeta {
                        labels: all_labels.clone(),
                    },
                    spec: PodSpec {
                        containers: vec![Container {
                            name: name.clone(),
                            image: self.image(project, tag),
                            command,
                            env,
                            resources: sizing.into(),
                            ports: vec![ContainerPort {
                                container_port: VIZ_PORT,
                            }],
                        }],
                        restart_policy: RestartPolicy::Always,
                    },
                },
            },
        };

        let service = ServiceManifest {
            api_version: "v1",
            kind: "Service",
            metadata: self.meta(&name, &all_labels),
            spec: ServiceSpec {
                service_type: "LoadBalancer",
                selector,
                ports: vec![ServicePort {
                    port: 80,
                    target_port: VIZ_PORT,
                    protocol: "TCP",
                }],
            },
        };

        let route = IngressRouteManifest {
            api_version: "traefik.containo.us/v1alpha1",
            kind: "IngressRoute",
            metadata: self.meta(&name, &all_labels),
            spec: IngressRouteSpec {
                entry_points: vec!["web".into(), "websecure".into()],
                routes: vec![Route {
                    match_rule: format!(
                        "Host(`{}`) && PathPrefix(`{}`)",
                        self.viz_host, prefix
                    ),
                    kind: "Rule",
                    services: vec![RouteService {
                        name: name.clone(),
                        port: 80,
                    }],
                }],
            },
        };

        Ok(VizObjects {
            deployment: deployment_manifest,
            service,
            route,
        })
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
