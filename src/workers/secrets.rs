//! Per-project secret injection.
//!
//! Secret values never pass through this service. We only learn which keys
//! a project's secret holds and emit env vars that reference them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::cluster::Cluster;
use super::manifests::{EnvVar, RESERVED_ENV, secret_name};
use super::models::Project;
use crate::errors::WorkersResult;

/// Source of the secret key names a project requires.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn secret_keys(&self, project: &Project) -> WorkersResult<Vec<String>>;
}

/// Reads key names from the project's orchestrator secret. No secret means no keys.
pub struct ClusterSecrets {
    cluster: Arc<dyn Cluster>,
}

impl ClusterSecrets {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl SecretSource for ClusterSecrets {
    async fn secret_keys(&self, project: &Project) -> WorkersResult<Vec<String>> {
        Ok(self
            .cluster
            .secret_keys(&secret_name(project))
            .await?
            .unwrap_or_default())
    }
}

#[derive(Clone)]
pub struct SecretInjector {
    source: Arc<dyn SecretSource>,
}

impl SecretInjector {
    pub fn new(source: Arc<dyn SecretSource>) -> Self {
        Self { source }
    }

    /// Env vars referencing every key of `project`'s secret, sorted by name.
    /// Keys named like a [`RESERVED_ENV`] var are skipped.
    pub async fn env_for(&self, project: &Project) -> WorkersResult<Vec<EnvVar>> {
        let mut keys = self.source.secret_keys(project).await?;
        keys.sort();
        keys.dedup();
        let secret = secret_name(project);
        keys.retain(|key| {
            let reserved = RESERVED_ENV.contains(&key.as_str());
            if reserved {
                warn!(project = %project.full_name(), key = %key, "Ignoring secret key that shadows a reserved env var");
            }
            !reserved
        });
        Ok(keys
            .iter()
            .map(|key| EnvVar::from_secret(&secret, key))
            .collect())
    }
}
