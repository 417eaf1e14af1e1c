//! Interactive app deployments.
//!
//! A deployment is a workload, a service and an ingress route sharing one
//! deterministic name. Nothing about it is stored locally; readiness is read
//! from the cluster on every request.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::cluster::Cluster;
use super::manifests::{SpecBuilder, deployment_name};
use super::models::{DeletionReport, Project, ReadinessReport, ResourceStatus};
use super::resources::size_for;
use super::secrets::SecretInjector;
use crate::errors::{WorkersError, WorkersResult};

/// Sizing profile used for interactive apps.
const VIZ_TASK: &str = "viz";

#[derive(Clone)]
pub struct DeploymentController {
    cluster: Arc<dyn Cluster>,
    secrets: SecretInjector,
    specs: Arc<SpecBuilder>,
}

impl DeploymentController {
    pub fn new(cluster: Arc<dyn Cluster>, secrets: SecretInjector, specs: Arc<SpecBuilder>) -> Self {
        Self {
            cluster,
            secrets,
            specs,
        }
    }

    /// Submit the workload, service and route for a new deployment.
    ///
    /// Fails with `Conflict` if a workload with the derived name already exists.
    #[instrument(skip(self, project), fields(project = %project.full_name()))]
    pub async fn create_deployment(
        &self,
        project: &Project,
        tag: &str,
        deployment: &str,
    ) -> WorkersResult<ReadinessReport> {
        validate_deployment_name(deployment)?;
        if !project.tech.is_viz() {
            return Err(WorkersError::BadRequest(format!(
                "{} is a {} project and has no interactive app",
                project.full_name(),
                project.tech.as_str()
            )));
        }

        let name = deployment_name(project, deployment);
        if self.cluster.get_deployment(&name).await?.is_some() {
            return Err(WorkersError::Conflict(format!(
                "deployment {} already exists",
                name
            )));
        }

        let sizing = size_for(project, VIZ_TASK)?;
        let secrets = self.secrets.env_for(project).await?;
        let objects = self.specs.viz(project, deployment, tag, &sizing, secrets)?;

        self.cluster.create_deployment(&objects.deployment).await?;
        self.cluster.create_service(&objects.service).await?;
        self.cluster.create_ingress_route(&objects.route).await?;
        info!(name = %name, tag, "Created deployment");

        self.get_deployment(project, deployment).await
    }

    /// Per-resource readiness, read live. Missing resources are not-ready, not errors.
    #[instrument(skip(self, project), fields(project = %project.full_name()))]
    pub async fn get_deployment(
        &self,
        project: &Project,
        deployment: &str,
    ) -> WorkersResult<ReadinessReport> {
        validate_deployment_name(deployment)?;
        let name = deployment_name(project, deployment);
        let (workload, service, route) = tokio::join!(
            self.cluster.get_deployment(&name),
            self.cluster.get_service(&name),
            self.cluster.get_ingress_route(&name),
        );

        let deployment = match workload? {
            Some(w) => ResourceStatus {
                ready: w.ready_replicas >= 1,
                created_at: w.created_at,
            },
            None => ResourceStatus::absent(),
        };
        let svc = match service? {
            Some(s) => ResourceStatus {
                ready: s.has_external_address,
                created_at: s.created_at,
            },
            None => ResourceStatus::absent(),
        };
        let ingressroute = match route? {
            Some(r) => ResourceStatus {
                ready: true,
                created_at: r.created_at,
            },
            None => ResourceStatus::absent(),
        };

        Ok(ReadinessReport {
            name,
            deployment,
            svc,
            ingressroute,
        })
    }

    /// Delete each resource independently. Partial deletion is a valid outcome;
    /// calling again converges.
    #[instrument(skip(self, project), fields(project = %project.full_name()))]
    pub async fn delete_deployment(
        &self,
        project: &Project,
        deployment: &str,
    ) -> WorkersResult<DeletionReport> {
        validate_deployment_name(deployment)?;
        let name = deployment_name(project, deployment);
        let (workload, service, route) = tokio::join!(
            self.cluster.delete_deployment(&name),
            self.cluster.delete_service(&name),
            self.cluster.delete_ingress_route(&name),
        );

        for (kind, result) in [("deployment", &workload), ("svc", &service), ("ingressroute", &route)] {
            if let Err(e) = result {
                warn!(name = %name, kind, error = %e, "Delete failed");
            }
        }

        let report = DeletionReport {
            name,
            deployment: workload?,
            svc: service?,
            ingressroute: route?,
        };
        info!(
            name = %report.name,
            deployment = report.deployment,
            svc = report.svc,
            ingressroute = report.ingressroute,
            "Deleted deployment"
        );
        Ok(report)
    }
}

fn validate_deployment_name(deployment: &str) -> WorkersResult<()> {
    if deployment.trim().is_empty() {
        return Err(WorkersError::BadRequest("deployment name is required".into()));
    }
    if !deployment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkersError::BadRequest(format!(
            "deployment name {:?} may only contain letters, digits, '-' and '_'",
            deployment
        )));
    }
    Ok(())
}
