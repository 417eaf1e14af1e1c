//! Service configuration.
//!
//! Read from `workers.toml`; every section and key is optional. Layering is
//! file → environment → CLI flags.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! public_url = "https://workers.example.com"
//!
//! [database]
//! path = "cs-workers.db"
//!
//! [cluster]
//! api_url = "https://kubernetes.default.svc"
//! namespace = "worker-api"
//! token_path = "/var/run/secrets/kubernetes.io/serviceaccount/token"
//! ca_cert_path = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
//! timeout_secs = 10
//! image_registry = "gcr.io/cs-workers"
//! viz_host = "viz.compute.studio"
//!
//! [github]
//! api_url = "https://api.github.com"
//! repo_owner = "compute-tooling"
//! repo_name = "compute-studio-publish"
//! primary_branch = "main"
//! timeout_secs = 15
//! config_dir = "config"
//!
//! [upstream]
//! timeout_secs = 15
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "workers.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub cluster: ClusterSection,
    pub github: GitHubSection,
    pub upstream: UpstreamSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Base URL workloads use to reach this service.
    pub public_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            public_url: "http://127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cs-workers.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterSection {
    pub api_url: String,
    pub namespace: String,
    pub token_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub image_registry: String,
    pub viz_host: String,
    /// Only ever set from `KUBE_TOKEN`.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            namespace: "worker-api".to_string(),
            token_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            ca_cert_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            timeout_secs: 10,
            image_registry: String::new(),
            viz_host: "localhost".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitHubSection {
    pub api_url: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub primary_branch: String,
    pub timeout_secs: u64,
    /// Directory on the branch holding one config file per app.
    pub config_dir: String,
    /// Only ever set from `GITHUB_TOKEN`.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            repo_owner: "compute-tooling".to_string(),
            repo_name: "compute-studio-publish".to_string(),
            primary_branch: "main".to_string(),
            timeout_secs: 15,
            config_dir: "config".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamSection {
    pub timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

impl WorkersConfig {
    /// Load from `path`. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load from `path` and apply process environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `GITHUB_TOKEN`, `KUBE_TOKEN`, `CS_WORKERS_PUBLIC_URL` and
    /// `CS_WORKERS_DB` through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(token) = non_empty("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(token) = non_empty("KUBE_TOKEN") {
            self.cluster.token = Some(token);
        }
        if let Some(url) = non_empty("CS_WORKERS_PUBLIC_URL") {
            self.server.public_url = url;
        }
        if let Some(path) = non_empty("CS_WORKERS_DB") {
            self.database.path = PathBuf::from(path);
        }
    }
}
