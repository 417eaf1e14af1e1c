//! One-shot compute jobs.
//!
//! `CREATED --(first poll)--> RUNNING --(complete)--> {SUCCESS, FAIL}`.
//! The workload polls its job to fetch inputs and posts its result back to
//! the callback route; the result is then relayed upstream in the background.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::cluster::Cluster;
use super::db::DbHandle;
use super::manifests::SpecBuilder;
use super::models::{Job, JobStatus, Project, User};
use super::relay::CallbackRelay;
use super::resources::size_for;
use super::secrets::SecretInjector;
use crate::errors::{WorkersError, WorkersResult};

#[derive(Clone)]
pub struct JobController {
    db: DbHandle,
    cluster: Arc<dyn Cluster>,
    secrets: SecretInjector,
    specs: Arc<SpecBuilder>,
    relay: CallbackRelay,
}

impl JobController {
    pub fn new(
        db: DbHandle,
        cluster: Arc<dyn Cluster>,
        secrets: SecretInjector,
        specs: Arc<SpecBuilder>,
        relay: CallbackRelay,
    ) -> Self {
        Self {
            db,
            cluster,
            secrets,
            specs,
            relay,
        }
    }

    /// Record a job and submit its workload.
    ///
    /// If submission fails the job is finalized as `FAIL` with the error in its
    /// outputs, and the error is returned.
    #[instrument(skip(self, project, inputs), fields(project = %project.full_name()))]
    pub async fn create_job(
        &self,
        project: &Project,
        task_name: &str,
        inputs: serde_json::Value,
        tag: &str,
    ) -> WorkersResult<Job> {
        if task_name.trim().is_empty() {
            return Err(WorkersError::BadRequest("task_name is required".into()));
        }
        if tag.trim().is_empty() {
            return Err(WorkersError::BadRequest("tag is required".into()));
        }
        let sizing = size_for(project, task_name)?;
        let secrets = self.secrets.env_for(project).await?;

        let (user_id, project_id) = (project.user_id, project.id);
        let (task, tag_owned) = (task_name.to_string(), tag.to_string());
        let job = self
            .db
            .call(move |db| db.create_job(user_id, project_id, &task, &tag_owned, &inputs))
            .await
            .map_err(WorkersError::Database)?;

        let manifest = self.specs.job(&job, project, &sizing, secrets);
        if let Err(e) = self.cluster.create_job(&manifest).await {
            warn!(job_id = %job.id, error = %e, "Job submission failed");
            let job_id = job.id;
            let outputs = serde_json::json!({ "error": e.to_string() });
            self.db
                .call(move |db| db.fail_unsubmitted_job(job_id, &outputs))
                .await
                .map_err(WorkersError::Database)?;
            return Err(e);
        }

        info!(job_id = %job.id, task = %job.task_name, "Submitted job");
        Ok(job)
    }

    async fn load(&self, job_id: Uuid, caller: Option<&User>) -> WorkersResult<Job> {
        let job = self
            .db
            .call(move |db| db.get_job(job_id))
            .await
            .map_err(WorkersError::Database)?
            .ok_or_else(|| WorkersError::not_found("Job", job_id))?;
        if caller.is_some_and(|user| user.id != job.user_id) {
            return Err(WorkersError::not_found("Job", job_id));
        }
        Ok(job)
    }

    /// Current job record. The first poll moves `CREATED` to `RUNNING`.
    #[instrument(skip(self, caller))]
    pub async fn poll_job(&self, job_id: Uuid, caller: Option<&User>) -> WorkersResult<Job> {
        let job = self.load(job_id, caller).await?;
        if job.status != JobStatus::Created {
            return Ok(job);
        }
        let started = self
            .db
            .call(move |db| db.mark_job_running(job_id))
            .await
            .map_err(WorkersError::Database)?;
        if started {
            info!(job_id = %job_id, "Job running");
        }
        self.load(job_id, caller).await
    }

    /// Finish a running job exactly once, then relay the result upstream.
    #[instrument(skip(self, caller, outputs))]
    pub async fn complete_job(
        &self,
        job_id: Uuid,
        caller: Option<&User>,
        outputs: serde_json::Value,
        status: JobStatus,
    ) -> WorkersResult<Job> {
        if !status.is_terminal() {
            return Err(WorkersError::BadRequest(format!(
                "{} is not a completion status",
                status.as_str()
            )));
        }
        self.load(job_id, caller).await?;

        let finished_at = Utc::now();
        let applied = self
            .db
            .call(move |db| db.complete_job(job_id, &outputs, status, finished_at))
            .await
            .map_err(WorkersError::Database)?;
        let job = self.load(job_id, caller).await?;

        if !applied {
            return Err(match job.status {
                JobStatus::Created => {
                    WorkersError::Conflict(format!("job {} has not started", job_id))
                }
                _ => WorkersError::Conflict(format!("job {} is already finished", job_id)),
            });
        }

        info!(job_id = %job_id, status = status.as_str(), "Job finished");
        self.relay.spawn_job(job.clone());
        Ok(job)
    }
}
