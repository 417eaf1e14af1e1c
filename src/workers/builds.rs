//! CI-driven image builds.
//!
//! A build opens (or reuses) a pull request that writes the app's config file
//! to the publishing repository; the repository's workflow builds, tests and
//! pushes the image. Polling inspects the newest workflow run on the branch
//! to advance the build's stage. The stage never moves backwards and
//! `finished_at` is set exactly once.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::db::{BuildProgress, DbHandle};
use super::github::{
    FileWrite, GitHub, NewPullRequest, RepoRef, WorkflowJob, WorkflowRun, WorkflowStep, latest_run,
};
use super::logs::{LogSection, parse_logs};
use super::manifests::dns_name;
use super::models::{
    Build, BuildProvider, BuildProviderData, BuildStage, BuildStatus, Project, User,
};
use super::relay::CallbackRelay;
use crate::errors::{WorkersError, WorkersResult};

const WORKFLOW_EVENT: &str = "pull_request";
const IMAGE_TAG_LEN: usize = 7;

/// Where and how builds are published.
#[derive(Debug, Clone)]
pub struct PublishTarget {
    pub repo: RepoRef,
    pub primary_branch: String,
    /// Directory holding one `{owner}/{title}.yaml` per app.
    pub config_dir: String,
}

/// Contents of the per-app config file the workflow consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub owner: String,
    pub title: String,
    pub tech: String,
    pub callable_name: Option<String>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub repo_url: String,
    pub repo_tag: String,
    /// Changes on every request so each write produces a new commit.
    pub requested_at: String,
}

impl AppConfig {
    pub fn for_project(project: &Project) -> Self {
        Self {
            owner: project.owner.clone(),
            title: project.title.clone(),
            tech: project.tech.as_str().to_string(),
            callable_name: project.callable_name.clone(),
            cpu: project.cpu,
            memory: project.memory,
            repo_url: project.repo_url.clone(),
            repo_tag: project.repo_tag.clone(),
            requested_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Optional overrides supplied when promoting a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Promotion {
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Stage of the step currently running, `Staging` when none of the known steps is.
pub fn stage_for_steps(steps: &[WorkflowStep]) -> BuildStage {
    steps
        .iter()
        .find(|s| s.status == "in_progress")
        .and_then(|s| step_stage(&s.name))
        .unwrap_or(BuildStage::Staging)
}

/// Stage of the first failed known step, if any.
pub fn failed_step_stage(steps: &[WorkflowStep]) -> Option<BuildStage> {
    steps
        .iter()
        .filter(|s| s.conclusion.as_deref() == Some("failure"))
        .find_map(|s| step_stage(&s.name))
}

fn step_stage(name: &str) -> Option<BuildStage> {
    match name.trim().to_ascii_lowercase().as_str() {
        "build" => Some(BuildStage::Building),
        "test" => Some(BuildStage::Testing),
        "push" => Some(BuildStage::Pushing),
        _ => None,
    }
}

/// True when `run` was triggered by this build's config commit. Builds
/// recorded without a commit only accept runs created after them.
fn run_belongs_to(build: &Build, run: &WorkflowRun) -> bool {
    match &build.provider_data.head_sha {
        Some(sha) => run.head_sha == *sha,
        None => run.created_at >= build.created_at,
    }
}

/// True when `title` mentions `owner/title` as a whole word.
fn references_project(pr_title: &str, full_name: &str) -> bool {
    pr_title.split_whitespace().any(|word| word == full_name)
}

#[derive(Clone)]
pub struct BuildPipeline {
    db: DbHandle,
    github: Arc<dyn GitHub>,
    relay: CallbackRelay,
    target: PublishTarget,
}

impl BuildPipeline {
    pub fn new(
        db: DbHandle,
        github: Arc<dyn GitHub>,
        relay: CallbackRelay,
        target: PublishTarget,
    ) -> Self {
        Self {
            db,
            github,
            relay,
            target,
        }
    }

    fn config_path(&self, project: &Project) -> String {
        format!(
            "{}/{}/{}.yaml",
            self.target.config_dir.trim_matches('/'),
            project.owner,
            project.title
        )
    }

    /// Open or reuse the project's pull request and record a new build.
    #[instrument(skip(self, project), fields(project = %project.full_name()))]
    pub async fn create_build(&self, project: &Project) -> WorkersResult<Build> {
        let repo = &self.target.repo;
        let full_name = project.full_name();

        let existing = self
            .github
            .open_pull_requests(repo)
            .await?
            .into_iter()
            .find(|pr| references_project(&pr.title, &full_name));

        let (branch, pull_request) = match existing {
            Some(pr) => {
                info!(pr = pr.number, branch = %pr.head.ref_name, "Reusing open pull request");
                (pr.head.ref_name, Some(pr.number))
            }
            None => {
                let base = self
                    .github
                    .branch_sha(repo, &self.target.primary_branch)
                    .await?
                    .ok_or_else(|| {
                        WorkersError::not_found("Branch", &self.target.primary_branch)
                    })?;
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                let branch = dns_name(&[&project.owner, &project.title, &suffix[..8]]);
                self.github.create_branch(repo, &branch, &base).await?;
                (branch, None)
            }
        };

        let path = self.config_path(project);
        let content = serde_yaml::to_string(&AppConfig::for_project(project))
            .context("Failed to encode app config")?;
        let sha = self.github.file_sha(repo, &path, &branch).await?;
        let file = FileWrite {
            path,
            branch: branch.clone(),
            message: format!("Build {}", full_name),
            content,
            sha,
        };
        let head_sha = self.github.put_file(repo, &file).await?;

        let pull_request = match pull_request {
            Some(number) => number,
            None => {
                let pr = NewPullRequest {
                    title: format!("Build {}", full_name),
                    head: branch.clone(),
                    base: self.target.primary_branch.clone(),
                    body: format!(
                        "Automated build of {} from {}@{}",
                        full_name, project.repo_url, project.repo_tag
                    ),
                };
                self.github.create_pull_request(repo, &pr).await?.number
            }
        };

        let data = BuildProviderData {
            repo_owner: repo.owner.clone(),
            repo_name: repo.name.clone(),
            branch,
            pull_request: Some(pull_request),
            head_sha: Some(head_sha),
            run_id: None,
            stage: BuildStage::Started,
            merged: false,
            logs: None,
        };
        let project_id = project.id;
        let build = self
            .db
            .call(move |db| db.create_build(project_id, BuildProvider::Github, &data))
            .await
            .map_err(WorkersError::Database)?;
        info!(build_id = build.id, pr = pull_request, "Created build");
        Ok(build)
    }

    async fn load(&self, build_id: i64) -> WorkersResult<Build> {
        self.db
            .call(move |db| db.get_build(build_id))
            .await
            .map_err(WorkersError::Database)?
            .ok_or_else(|| WorkersError::not_found("Build", build_id))
    }

    /// Load a build and its project, hiding builds of other users' projects.
    pub async fn load_owned(&self, build_id: i64, caller: &User) -> WorkersResult<(Build, Project)> {
        let build = self.load(build_id).await?;
        let project_id = build.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .map_err(WorkersError::Database)?
            .filter(|p| p.user_id == caller.id)
            .ok_or_else(|| WorkersError::not_found("Build", build_id))?;
        Ok((build, project))
    }

    fn repo_of(build: &Build) -> RepoRef {
        RepoRef {
            owner: build.provider_data.repo_owner.clone(),
            name: build.provider_data.repo_name.clone(),
        }
    }

    /// Workflow runs on the build's branch that were triggered by this build.
    async fn runs_for(&self, repo: &RepoRef, build: &Build) -> WorkersResult<Vec<WorkflowRun>> {
        let runs = self
            .github
            .workflow_runs(repo, &build.provider_data.branch, WORKFLOW_EVENT)
            .await?;
        Ok(runs
            .into_iter()
            .filter(|run| run_belongs_to(build, run))
            .collect())
    }

    /// Best-effort log sections for a finished run's first job.
    async fn fetch_logs(
        &self,
        repo: &RepoRef,
        job: &WorkflowJob,
    ) -> Option<Vec<LogSection>> {
        match self.github.job_logs(repo, job.id).await {
            Ok(Some(raw)) => Some(parse_logs(&raw)),
            Ok(None) => None,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Could not fetch build logs");
                None
            }
        }
    }

    /// Refresh a build from its newest workflow run.
    #[instrument(skip(self, caller), fields(user = %caller.username))]
    pub async fn poll_build(&self, build_id: i64, caller: &User) -> WorkersResult<Build> {
        let (build, project) = self.load_owned(build_id, caller).await?;
        if build.finished_at.is_some() {
            return Ok(build);
        }

        let repo = Self::repo_of(&build);
        let runs = self.runs_for(&repo, &build).await?;
        let Some(run) = latest_run(&runs) else {
            return Ok(build);
        };
        let jobs = self.github.run_jobs(&repo, run.id).await?;
        let first_job = jobs.first();

        let progress = self.progress_from(&build, &repo, run, first_job).await;
        let terminal = progress.finished_at.is_some();
        let applied = self
            .db
            .call(move |db| db.record_build_progress(build_id, &progress))
            .await
            .map_err(WorkersError::Database)?;

        let updated = self.load(build_id).await?;
        if applied && terminal {
            info!(
                build_id,
                status = updated.status.as_str(),
                stage = updated.stage().as_str(),
                "Build finished"
            );
            self.relay.spawn_build(updated.clone(), project.user_id);
        }
        Ok(updated)
    }

    async fn progress_from(
        &self,
        build: &Build,
        repo: &RepoRef,
        run: &WorkflowRun,
        job: Option<&WorkflowJob>,
    ) -> BuildProgress {
        let steps = job.map(|j| j.steps.as_slice()).unwrap_or_default();
        let current = build.stage().advance(stage_for_steps(steps));

        let mut data = build.provider_data.clone();
        data.run_id = Some(run.id);

        if !run.is_completed() {
            data.stage = current;
            return BuildProgress {
                provider_data: data,
                status: BuildStatus::Running,
                failed_at_stage: None,
                image_tag: None,
                finished_at: None,
            };
        }

        if let Some(job) = job {
            data.logs = self.fetch_logs(repo, job).await;
        }

        let (status, stage, failed_at_stage, image_tag) = match run.conclusion.as_deref() {
            Some("success") => (
                BuildStatus::Success,
                BuildStage::Success,
                None,
                Some(run.head_sha.chars().take(IMAGE_TAG_LEN).collect::<String>()),
            ),
            Some("cancelled") => (BuildStatus::Cancelled, BuildStage::Cancelled, None, None),
            _ => {
                let failed = failed_step_stage(steps)
                    .map(|s| current.advance(s))
                    .unwrap_or(current);
                (BuildStatus::Failure, BuildStage::Failure, Some(failed), None)
            }
        };
        data.stage = current.advance(stage);

        BuildProgress {
            provider_data: data,
            status,
            failed_at_stage,
            image_tag,
            finished_at: Some(Utc::now()),
        }
    }

    /// Ask GitHub to cancel the run, then mark the build cancelled regardless.
    #[instrument(skip(self, caller), fields(user = %caller.username))]
    pub async fn cancel_build(&self, build_id: i64, caller: &User) -> WorkersResult<Build> {
        let (build, _) = self.load_owned(build_id, caller).await?;
        match build.status {
            BuildStatus::Cancelled => return Ok(build),
            BuildStatus::Success | BuildStatus::Failure => {
                return Err(WorkersError::Conflict(format!(
                    "build {} already finished with {}",
                    build_id,
                    build.status.as_str()
                )));
            }
            BuildStatus::Created | BuildStatus::Running => {}
        }

        let repo = Self::repo_of(&build);
        if let Err(e) = self.cancel_remote(&repo, &build).await {
            warn!(build_id, error = %e, "Provider-side cancel failed; cancelling locally");
        }

        let mut data = build.provider_data.clone();
        data.stage = BuildStage::Cancelled;
        let at = Utc::now();
        let applied = self
            .db
            .call(move |db| db.cancel_build(build_id, &data, at))
            .await
            .map_err(WorkersError::Database)?;

        let updated = self.load(build_id).await?;
        if !applied && updated.status != BuildStatus::Cancelled {
            return Err(WorkersError::Conflict(format!(
                "build {} finished before it could be cancelled",
                build_id
            )));
        }
        info!(build_id, "Build cancelled");
        Ok(updated)
    }

    async fn cancel_remote(&self, repo: &RepoRef, build: &Build) -> WorkersResult<()> {
        let run_id = match build.provider_data.run_id {
            Some(id) => Some(id),
            None => {
                let runs = self.runs_for(repo, build).await?;
                latest_run(&runs)
                    .filter(|run| !run.is_completed())
                    .map(|run| run.id)
            }
        };
        if let Some(run_id) = run_id {
            self.github.cancel_run(repo, run_id).await?;
        }
        Ok(())
    }

    /// Promote a successful build: merge its pull request, record the image
    /// tag and version, and point the project at the new tag.
    #[instrument(skip(self, caller, promotion), fields(user = %caller.username))]
    pub async fn finish_build(
        &self,
        build_id: i64,
        caller: &User,
        promotion: Promotion,
    ) -> WorkersResult<Build> {
        let (build, project) = self.load_owned(build_id, caller).await?;
        if build.status != BuildStatus::Success {
            return Err(WorkersError::Conflict(format!(
                "build {} is {}; only successful builds can be promoted",
                build_id,
                build.status.as_str()
            )));
        }
        let image_tag = promotion
            .image_tag
            .clone()
            .or_else(|| build.image_tag.clone())
            .ok_or_else(|| {
                WorkersError::BadRequest(format!("build {} has no image tag", build_id))
            })?;

        let repo = Self::repo_of(&build);
        let mut data = build.provider_data.clone();
        if !data.merged {
            if let Some(number) = data.pull_request {
                self.github.merge_pull_request(&repo, number).await?;
                info!(build_id, pr = number, "Merged build pull request");
            }
            data.merged = true;
            if let Err(e) = self.github.delete_branch(&repo, &data.branch).await {
                warn!(build_id, branch = %data.branch, error = %e, "Could not delete build branch");
            }
        }

        let tag = image_tag.clone();
        let version = promotion.version.clone();
        let project_id = project.id;
        let promoted = self
            .db
            .call(move |db| {
                let build =
                    db.set_build_artifacts(build_id, &data, Some(&tag), version.as_deref())?;
                db.update_project_latest_tag(project_id, &tag)?;
                Ok(build)
            })
            .await
            .map_err(WorkersError::Database)?;

        info!(build_id, image_tag = %image_tag, "Promoted build");
        self.relay.spawn_build(promoted.clone(), project.user_id);
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::fakes::{FakeGitHub, FakeUpstream, seeded_db};
    use crate::workers::models::TechKind;

    struct Harness {
        pipeline: BuildPipeline,
        github: Arc<FakeGitHub>,
        upstream: Arc<FakeUpstream>,
        db: DbHandle,
        user: User,
        project: Project,
    }

    fn harness() -> Harness {
        let (db, user, project) = seeded_db(TechKind::Batch);
        let github = Arc::new(FakeGitHub::new());
        let upstream = Arc::new(FakeUpstream::default());
        let pipeline = BuildPipeline::new(
            db.clone(),
            github.clone(),
            CallbackRelay::new(db.clone(), upstream.clone()),
            PublishTarget {
                repo: FakeGitHub::repo(),
                primary_branch: "main".into(),
                config_dir: "config".into(),
            },
        );
        Harness {
            pipeline,
            github,
            upstream,
            db,
            user,
            project,
        }
    }

    fn step(name: &str, status: &str, conclusion: Option<&str>) -> WorkflowStep {
        WorkflowStep {
            name: name.into(),
            status: status.into(),
            conclusion: conclusion.map(String::from),
            number: 1,
        }
    }

    /// A run triggered by `build`'s config commit.
    fn run(id: u64, build: &Build, status: &str, conclusion: Option<&str>, at: &str) -> WorkflowRun {
        WorkflowRun {
            id,
            status: status.into(),
            conclusion: conclusion.map(String::from),
            head_branch: Some(build.provider_data.branch.clone()),
            head_sha: build.provider_data.head_sha.clone().unwrap_or_default(),
            event: "pull_request".into(),
            html_url: String::new(),
            created_at: at.parse().unwrap(),
        }
    }

    fn job(id: u64, steps: Vec<WorkflowStep>) -> WorkflowJob {
        WorkflowJob {
            id,
            name: "build".into(),
            status: "in_progress".into(),
            conclusion: None,
            steps,
        }
    }

    #[test]
    fn test_stage_for_steps() {
        assert_eq!(stage_for_steps(&[]), BuildStage::Staging);
        let steps = vec![
            step("Set up job", "completed", Some("success")),
            step("Build", "in_progress", None),
            step("Test", "queued", None),
        ];
        assert_eq!(stage_for_steps(&steps), BuildStage::Building);
        let steps = vec![step("Test", "in_progress", None)];
        assert_eq!(stage_for_steps(&steps), BuildStage::Testing);
        let steps = vec![step("Push", "in_progress", None)];
        assert_eq!(stage_for_steps(&steps), BuildStage::Pushing);
        let steps = vec![step("Checkout", "in_progress", None)];
        assert_eq!(stage_for_steps(&steps), BuildStage::Staging);
    }

    #[test]
    fn test_references_project() {
        assert!(references_project("Build hdoupe/Matchups", "hdoupe/Matchups"));
        assert!(!references_project(
            "Build hdoupe/Matchups-v2",
            "hdoupe/Matchups"
        ));
    }

    #[tokio::test]
    async fn test_create_build_opens_branch_and_pull_request() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();

        assert_eq!(build.status, BuildStatus::Created);
        assert_eq!(build.stage(), BuildStage::Started);
        let data = &build.provider_data;
        assert!(data.branch.starts_with("hdoupe-matchups-"));
        assert!(h.github.has_branch(&data.branch));
        assert_eq!(data.pull_request, Some(1));

        let content = h
            .github
            .file(&data.branch, "config/hdoupe/Matchups.yaml")
            .unwrap();
        let config: AppConfig = serde_yaml::from_str(&content).unwrap();
        assert_eq!(config.title, "Matchups");
        assert_eq!(config.tech, "python-paramtools");

        let pulls = h.github.open_pulls();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].title, "Build hdoupe/Matchups");
    }

    #[tokio::test]
    async fn test_create_build_reuses_open_pull_request() {
        let h = harness();
        let number = h
            .github
            .open_pull("Build hdoupe/Matchups", "hdoupe-matchups-existing");

        let first = h.pipeline.create_build(&h.project).await.unwrap();
        let second = h.pipeline.create_build(&h.project).await.unwrap();

        for build in [&first, &second] {
            assert_eq!(build.provider_data.branch, "hdoupe-matchups-existing");
            assert_eq!(build.provider_data.pull_request, Some(number));
        }
        assert_eq!(h.github.open_pulls().len(), 1);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_reused_branch_ignores_previous_attempts_run() {
        let h = harness();
        h.github
            .open_pull("Build hdoupe/Matchups", "hdoupe-matchups-existing");
        h.github.push_run(
            WorkflowRun {
                id: 5,
                status: "completed".into(),
                conclusion: Some("failure".into()),
                head_branch: Some("hdoupe-matchups-existing".into()),
                head_sha: "pr-sha".into(),
                event: "pull_request".into(),
                html_url: String::new(),
                created_at: "2021-09-01T12:00:00Z".parse().unwrap(),
            },
            vec![],
        );

        let build = h.pipeline.create_build(&h.project).await.unwrap();
        assert_ne!(build.provider_data.head_sha.as_deref(), Some("pr-sha"));

        let polled = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(polled.status, BuildStatus::Created);
        assert_eq!(polled.stage(), BuildStage::Started);
        assert!(polled.finished_at.is_none());
        assert!(polled.provider_data.run_id.is_none());

        h.github.push_run(
            run(6, &build, "in_progress", None, "2021-09-01T12:05:00Z"),
            vec![job(60, vec![step("Build", "in_progress", None)])],
        );
        let polled = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(polled.status, BuildStatus::Running);
        assert_eq!(polled.provider_data.run_id, Some(6));
        assert!(h.upstream.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_builds_without_commit_only_accept_newer_runs() {
        let h = harness();
        let mut build = h.pipeline.create_build(&h.project).await.unwrap();
        build.provider_data.head_sha = None;

        let older = run(1, &build, "completed", Some("failure"), "2021-09-01T12:00:00Z");
        assert!(!run_belongs_to(&build, &older));
        let mut newer = older.clone();
        newer.created_at = build.created_at + chrono::Duration::seconds(5);
        assert!(run_belongs_to(&build, &newer));
    }

    #[tokio::test]
    async fn test_poll_without_runs_keeps_build() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        let polled = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(polled.stage(), BuildStage::Started);
        assert_eq!(polled.status, BuildStatus::Created);
    }

    #[tokio::test]
    async fn test_poll_tracks_stages_monotonically_to_success() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        let ts = "2021-09-01T12:00:00Z";

        h.github.push_run(
            run(10, &build, "in_progress", None, ts),
            vec![job(100, vec![step("Test", "in_progress", None)])],
        );
        let polled = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(polled.stage(), BuildStage::Testing);
        assert_eq!(polled.status, BuildStatus::Running);
        assert_eq!(polled.provider_data.run_id, Some(10));

        // A stale observation never moves the stage back.
        h.github.push_run(
            run(10, &build, "in_progress", None, ts),
            vec![job(100, vec![step("Build", "in_progress", None)])],
        );
        let polled = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(polled.stage(), BuildStage::Testing);

        h.github.set_logs(
            100,
            "##[group]Run cs workers models build\n##[endgroup]\nbuilt\n",
        );
        h.github.push_run(
            run(10, &build, "completed", Some("success"), ts),
            vec![job(100, vec![step("Push", "completed", Some("success"))])],
        );
        let done = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(done.status, BuildStatus::Success);
        assert_eq!(done.stage(), BuildStage::Success);
        assert_eq!(done.image_tag.as_deref(), Some("c0ffee0"));
        assert!(done.finished_at.is_some());
        let logs = done.provider_data.logs.as_ref().unwrap();
        assert_eq!(logs[0].logs, "built");

        let sent = h.upstream.wait_for_deliveries(1).await;
        assert_eq!(
            sent[0].delivery.path,
            format!("/projects/api/v1/builds/{}/", build.id)
        );

        // Finished builds are frozen.
        h.github.push_run(
            run(11, &build, "in_progress", None, "2021-09-02T12:00:00Z"),
            vec![],
        );
        let again = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(again.finished_at, done.finished_at);
        assert_eq!(again.stage(), BuildStage::Success);
    }

    #[tokio::test]
    async fn test_failed_run_records_failed_stage_without_logs() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        h.github.fail_logs(true);
        h.github.push_run(
            run(20, &build, "completed", Some("failure"), "2021-09-01T12:00:00Z"),
            vec![job(
                200,
                vec![
                    step("Build", "completed", Some("success")),
                    step("Test", "completed", Some("failure")),
                ],
            )],
        );

        let done = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(done.status, BuildStatus::Failure);
        assert_eq!(done.stage(), BuildStage::Failure);
        assert_eq!(done.failed_at_stage, Some(BuildStage::Testing));
        assert!(done.provider_data.logs.is_none());
        assert!(done.image_tag.is_none());
    }

    #[tokio::test]
    async fn test_poll_uses_latest_run() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        h.github.push_run(
            run(1, &build, "completed", Some("failure"), "2021-09-01T12:00:00Z"),
            vec![],
        );
        h.github.push_run(
            run(2, &build, "in_progress", None, "2021-09-02T12:00:00Z"),
            vec![job(1, vec![step("Build", "in_progress", None)])],
        );
        let polled = h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        assert_eq!(polled.status, BuildStatus::Running);
        assert_eq!(polled.provider_data.run_id, Some(2));
    }

    #[tokio::test]
    async fn test_cancel_is_local_even_if_provider_fails() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        h.github.push_run(
            run(30, &build, "in_progress", None, "2021-09-01T12:00:00Z"),
            vec![],
        );
        h.github.fail_cancel(true);

        let cancelled = h.pipeline.cancel_build(build.id, &h.user).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert_eq!(cancelled.stage(), BuildStage::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(cancelled.finished_at.is_some());

        let again = h.pipeline.cancel_build(build.id, &h.user).await.unwrap();
        assert_eq!(again.cancelled_at, cancelled.cancelled_at);
    }

    #[tokio::test]
    async fn test_cancel_requests_provider_cancel() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        h.github.push_run(
            run(31, &build, "in_progress", None, "2021-09-01T12:00:00Z"),
            vec![],
        );
        h.pipeline.cancel_build(build.id, &h.user).await.unwrap();
        assert_eq!(h.github.cancelled(), vec![31]);
    }

    #[tokio::test]
    async fn test_cancel_finished_build_conflicts() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        h.github.push_run(
            run(40, &build, "completed", Some("success"), "2021-09-01T12:00:00Z"),
            vec![],
        );
        h.pipeline.poll_build(build.id, &h.user).await.unwrap();
        let err = h.pipeline.cancel_build(build.id, &h.user).await.unwrap_err();
        assert!(matches!(err, WorkersError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_promotion_merges_and_updates_project_tag() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        let branch = build.provider_data.branch.clone();
        h.github.push_run(
            run(50, &build, "completed", Some("success"), "2021-09-01T12:00:00Z"),
            vec![],
        );
        h.pipeline.poll_build(build.id, &h.user).await.unwrap();

        let promoted = h
            .pipeline
            .finish_build(
                build.id,
                &h.user,
                Promotion {
                    image_tag: None,
                    version: Some("1.4.0".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(promoted.version.as_deref(), Some("1.4.0"));
        assert_eq!(promoted.image_tag.as_deref(), Some("c0ffee0"));
        assert!(promoted.provider_data.merged);
        assert_eq!(h.github.merged(), vec![1]);
        assert_eq!(h.github.deleted_branches(), vec![branch]);

        let project_id = h.project.id;
        let project = h
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.latest_tag.as_deref(), Some("c0ffee0"));

        // Promoting again does not try to merge twice.
        h.pipeline
            .finish_build(build.id, &h.user, Promotion::default())
            .await
            .unwrap();
        assert_eq!(h.github.merged(), vec![1]);
    }

    #[tokio::test]
    async fn test_promoting_unfinished_build_conflicts() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        let err = h
            .pipeline
            .finish_build(build.id, &h.user, Promotion::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkersError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_foreign_build_is_not_found() {
        let h = harness();
        let build = h.pipeline.create_build(&h.project).await.unwrap();
        let mut stranger = h.user.clone();
        stranger.id += 100;
        let err = h.pipeline.poll_build(build.id, &stranger).await.unwrap_err();
        assert!(matches!(err, WorkersError::NotFound { .. }));
    }
}
