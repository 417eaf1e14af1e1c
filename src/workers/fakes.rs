//! In-memory stand-ins for the cluster, GitHub and upstream webapps.
//!
//! Each fake records what it was asked to do so tests can assert on it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::cluster::{Cluster, RouteState, ServiceState, WorkloadState};
use super::db::{DbHandle, WorkersDb};
use super::github::{
    FileWrite, GitHub, NewPullRequest, PullRequest, PullRequestHead, RepoRef, WorkflowJob,
    WorkflowRun,
};
use super::manifests::{DeploymentManifest, IngressRouteManifest, JobManifest, ServiceManifest};
use super::models::{Job, JobStatus, Project, ProjectSync, TechKind, User};
use super::relay::{Delivery, DeliveryOutcome, TokenGrant, Upstream};
use crate::errors::{WorkersError, WorkersResult};

pub fn sample_project() -> Project {
    Project {
        id: 1,
        user_id: 1,
        owner: "hdoupe".into(),
        title: "Matchups".into(),
        tech: TechKind::Batch,
        callable_name: None,
        cpu: Some(4.0),
        memory: Some(10.0),
        repo_url: "https://github.com/hdoupe/Matchups".into(),
        repo_tag: "master".into(),
        latest_tag: Some("abc1234".into()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn sample_job(task: &str) -> Job {
    Job {
        id: Uuid::new_v4(),
        user_id: 1,
        project_id: 1,
        task_name: task.into(),
        tag: "abc1234".into(),
        inputs: serde_json::json!({"year": 2021}),
        outputs: None,
        status: JobStatus::Created,
        created_at: Utc::now(),
        finished_at: None,
    }
}

pub fn project_sync(owner: &str, title: &str, tech: TechKind) -> ProjectSync {
    ProjectSync {
        owner: owner.into(),
        title: title.into(),
        tech,
        callable_name: tech.is_viz().then(|| "app:server".to_string()),
        cpu: Some(2.0),
        memory: Some(5.0),
        repo_url: format!("https://github.com/{}/{}", owner, title),
        repo_tag: "master".into(),
        latest_tag: Some("abc1234".into()),
    }
}

/// Database with one registered webapp owning one project of kind `tech`.
pub fn seeded_db(tech: TechKind) -> (DbHandle, User, Project) {
    let db = WorkersDb::new_in_memory().unwrap();
    let user = db
        .create_user("webapp", "https://compute.studio", "cid", "csecret")
        .unwrap();
    db.update_user_access_token(
        user.id,
        "cached-token",
        Utc::now() + chrono::Duration::hours(1),
    )
    .unwrap();
    let project = match db
        .upsert_project(user.id, &project_sync("hdoupe", "Matchups", tech))
        .unwrap()
    {
        super::db::SyncOutcome::Created(p) => p,
        other => panic!("unexpected sync outcome: {:?}", other),
    };
    (DbHandle::new(db), user, project)
}

fn unavailable(service: &'static str) -> WorkersError {
    WorkersError::transient(service, "simulated outage")
}

// ── Cluster ───────────────────────────────────────────────────────────

#[derive(Default)]
struct ClusterState {
    jobs: Vec<JobManifest>,
    deployments: HashMap<String, WorkloadState>,
    services: HashMap<String, ServiceState>,
    routes: HashMap<String, RouteState>,
    secrets: HashMap<String, Vec<String>>,
    unavailable: bool,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn put_secret(&self, name: &str, keys: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(name.into(), keys.iter().map(|k| k.to_string()).collect());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn submitted_jobs(&self) -> Vec<JobManifest> {
        self.state.lock().unwrap().jobs.clone()
    }

    /// Simulate the workload scheduling and the load balancer getting an address.
    pub fn provision(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(d) = state.deployments.get_mut(name) {
            d.ready_replicas = 1;
        }
        if let Some(s) = state.services.get_mut(name) {
            s.has_external_address = true;
        }
    }

    pub fn remove_route(&self, name: &str) {
        self.state.lock().unwrap().routes.remove(name);
    }

    pub fn has_deployment(&self, name: &str) -> bool {
        self.state.lock().unwrap().deployments.contains_key(name)
    }

    fn guard(&self) -> WorkersResult<std::sync::MutexGuard<'_, ClusterState>> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(unavailable("kubernetes"));
        }
        Ok(state)
    }
}

fn insert_new<V>(map: &mut HashMap<String, V>, name: &str, value: V) -> WorkersResult<()> {
    if map.contains_key(name) {
        return Err(WorkersError::Conflict(format!("{} already exists", name)));
    }
    map.insert(name.to_string(), value);
    Ok(())
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_job(&self, manifest: &JobManifest) -> WorkersResult<()> {
        self.guard()?.jobs.push(manifest.clone());
        Ok(())
    }

    async fn create_deployment(&self, manifest: &DeploymentManifest) -> WorkersResult<()> {
        let state = WorkloadState {
            created_at: Some(Utc::now()),
            ready_replicas: 0,
        };
        insert_new(
            &mut self.guard()?.deployments,
            &manifest.metadata.name,
            state,
        )
    }

    async fn create_service(&self, manifest: &ServiceManifest) -> WorkersResult<()> {
        let state = ServiceState {
            created_at: Some(Utc::now()),
            has_external_address: false,
        };
        insert_new(&mut self.guard()?.services, &manifest.metadata.name, state)
    }

    async fn create_ingress_route(&self, manifest: &IngressRouteManifest) -> WorkersResult<()> {
        let state = RouteState {
            created_at: Some(Utc::now()),
        };
        insert_new(&mut self.guard()?.routes, &manifest.metadata.name, state)
    }

    async fn get_deployment(&self, name: &str) -> WorkersResult<Option<WorkloadState>> {
        Ok(self.guard()?.deployments.get(name).cloned())
    }

    async fn get_service(&self, name: &str) -> WorkersResult<Option<ServiceState>> {
        Ok(self.guard()?.services.get(name).cloned())
    }

    async fn get_ingress_route(&self, name: &str) -> WorkersResult<Option<RouteState>> {
        Ok(self.guard()?.routes.get(name).cloned())
    }

    async fn delete_deployment(&self, name: &str) -> WorkersResult<bool> {
        Ok(self.guard()?.deployments.remove(name).is_some())
    }

    async fn delete_service(&self, name: &str) -> WorkersResult<bool> {
        Ok(self.guard()?.services.remove(name).is_some())
    }

    async fn delete_ingress_route(&self, name: &str) -> WorkersResult<bool> {
        Ok(self.guard()?.routes.remove(name).is_some())
    }

    async fn secret_keys(&self, name: &str) -> WorkersResult<Option<Vec<String>>> {
        Ok(self.guard()?.secrets.get(name).cloned())
    }
}

// ── GitHub ────────────────────────────────────────────────────────────

struct GitHubState {
    branches: HashMap<String, String>,
    files: HashMap<(String, String), String>,
    pulls: Vec<PullRequest>,
    next_pr: u64,
    merged: Vec<u64>,
    runs: Vec<WorkflowRun>,
    jobs: HashMap<u64, Vec<WorkflowJob>>,
    logs: HashMap<u64, String>,
    cancelled: Vec<u64>,
    deleted_branches: Vec<String>,
    fail_logs: bool,
    fail_cancel: bool,
    commits: u64,
}

pub struct FakeGitHub {
    state: Mutex<GitHubState>,
}

impl FakeGitHub {
    /// A repository with a `main` branch and nothing else.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GitHubState {
                branches: HashMap::from([("main".to_string(), "base-sha".to_string())]),
                files: HashMap::new(),
                pulls: Vec::new(),
                next_pr: 1,
                merged: Vec::new(),
                runs: Vec::new(),
                jobs: HashMap::new(),
                logs: HashMap::new(),
                cancelled: Vec::new(),
                deleted_branches: Vec::new(),
                fail_logs: false,
                fail_cancel: false,
                commits: 0,
            }),
        }
    }

    pub fn repo() -> RepoRef {
        RepoRef {
            owner: "compute-tooling".into(),
            name: "compute-studio-publish".into(),
        }
    }

    /// Seed an already-open pull request from `branch`.
    pub fn open_pull(&self, title: &str, branch: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.branches.insert(branch.into(), "pr-sha".into());
        let number = state.next_pr;
        state.next_pr += 1;
        state.pulls.push(pull(number, title, branch));
        number
    }

    pub fn push_run(&self, run: WorkflowRun, jobs: Vec<WorkflowJob>) {
        let mut state = self.state.lock().unwrap();
        state.jobs.insert(run.id, jobs);
        state.runs.retain(|r| r.id != run.id);
        state.runs.push(run);
    }

    pub fn set_logs(&self, job_id: u64, logs: &str) {
        self.state.lock().unwrap().logs.insert(job_id, logs.into());
    }

    pub fn fail_logs(&self, fail: bool) {
        self.state.lock().unwrap().fail_logs = fail;
    }

    pub fn fail_cancel(&self, fail: bool) {
        self.state.lock().unwrap().fail_cancel = fail;
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(branch.to_string(), path.to_string()))
            .cloned()
    }

    pub fn open_pulls(&self) -> Vec<PullRequest> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn merged(&self) -> Vec<u64> {
        self.state.lock().unwrap().merged.clone()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn deleted_branches(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_branches.clone()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state.lock().unwrap().branches.contains_key(branch)
    }
}

fn pull(number: u64, title: &str, branch: &str) -> PullRequest {
    PullRequest {
        number,
        title: title.into(),
        state: "open".into(),
        html_url: format!("https://github.com/x/y/pull/{}", number),
        head: PullRequestHead {
            ref_name: branch.into(),
            sha: "pr-sha".into(),
        },
    }
}

#[async_trait]
impl GitHub for FakeGitHub {
    async fn branch_sha(&self, _repo: &RepoRef, branch: &str) -> WorkersResult<Option<String>> {
        Ok(self.state.lock().unwrap().branches.get(branch).cloned())
    }

    async fn create_branch(&self, _repo: &RepoRef, branch: &str, sha: &str) -> WorkersResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.branches.contains_key(branch) {
            return Err(WorkersError::Other(anyhow::anyhow!(
                "Reference already exists"
            )));
        }
        state.branches.insert(branch.into(), sha.into());
        Ok(())
    }

    async fn delete_branch(&self, _repo: &RepoRef, branch: &str) -> WorkersResult<bool> {
        let mut state = self.state.lock().unwrap();
        let existed = state.branches.remove(branch).is_some();
        if existed {
            state.deleted_branches.push(branch.into());
        }
        Ok(existed)
    }

    async fn file_sha(
        &self,
        _repo: &RepoRef,
        path: &str,
        branch: &str,
    ) -> WorkersResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .contains_key(&(branch.to_string(), path.to_string()))
            .then(|| format!("blob-{}", path)))
    }

    async fn put_file(&self, _repo: &RepoRef, file: &FileWrite) -> WorkersResult<String> {
        let mut state = self.state.lock().unwrap();
        if !state.branches.contains_key(&file.branch) {
            return Err(WorkersError::not_found("Branch", &file.branch));
        }
        let key = (file.branch.clone(), file.path.clone());
        if state.files.contains_key(&key) && file.sha.is_none() {
            return Err(WorkersError::Other(anyhow::anyhow!("sha wasn't supplied")));
        }
        state.files.insert(key, file.content.clone());
        state.commits += 1;
        let commit = format!("c0ffee{:034x}", state.commits);
        state.branches.insert(file.branch.clone(), commit.clone());
        Ok(commit)
    }

    async fn open_pull_requests(&self, _repo: &RepoRef) -> WorkersResult<Vec<PullRequest>> {
        Ok(self.state.lock().unwrap().pulls.clone())
    }

    async fn create_pull_request(
        &self,
        _repo: &RepoRef,
        pr: &NewPullRequest,
    ) -> WorkersResult<PullRequest> {
        let mut state = self.state.lock().unwrap();
        let number = state.next_pr;
        state.next_pr += 1;
        let created = pull(number, &pr.title, &pr.head);
        state.pulls.push(created.clone());
        Ok(created)
    }

    async fn merge_pull_request(&self, _repo: &RepoRef, number: u64) -> WorkersResult<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.pulls.len();
        state.pulls.retain(|p| p.number != number);
        if state.pulls.len() == before {
            return Err(WorkersError::Other(anyhow::anyhow!(
                "Pull Request is not mergeable"
            )));
        }
        state.merged.push(number);
        Ok(())
    }

    async fn workflow_runs(
        &self,
        _repo: &RepoRef,
        branch: &str,
        _event: &str,
    ) -> WorkersResult<Vec<WorkflowRun>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .runs
            .iter()
            .filter(|r| r.head_branch.as_deref() == Some(branch))
            .cloned()
            .collect())
    }

    async fn run_jobs(&self, _repo: &RepoRef, run_id: u64) -> WorkersResult<Vec<WorkflowJob>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn job_logs(&self, _repo: &RepoRef, job_id: u64) -> WorkersResult<Option<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_logs {
            return Err(unavailable("github"));
        }
        Ok(state.logs.get(&job_id).cloned())
    }

    async fn cancel_run(&self, _repo: &RepoRef, run_id: u64) -> WorkersResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_cancel {
            return Err(unavailable("github"));
        }
        state.cancelled.push(run_id);
        Ok(())
    }
}

// ── Upstream ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SentDelivery {
    pub username: String,
    pub token: String,
    pub delivery: Delivery,
}

#[derive(Default)]
struct UpstreamState {
    token_requests: usize,
    deliveries: Vec<SentDelivery>,
    rejected: HashSet<String>,
    reject_all: bool,
    fail_deliveries: bool,
}

#[derive(Default)]
pub struct FakeUpstream {
    state: Mutex<UpstreamState>,
}

impl FakeUpstream {
    pub fn token_requests(&self) -> usize {
        self.state.lock().unwrap().token_requests
    }

    pub fn deliveries(&self) -> Vec<SentDelivery> {
        self.state.lock().unwrap().deliveries.clone()
    }

    pub fn reject_tokens(&self, tokens: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.rejected.extend(tokens.iter().map(|t| t.to_string()));
    }

    pub fn reject_all_tokens(&self, reject: bool) {
        self.state.lock().unwrap().reject_all = reject;
    }

    pub fn fail_deliveries(&self, fail: bool) {
        self.state.lock().unwrap().fail_deliveries = fail;
    }

    /// Wait for background relays to deliver at least `n` results.
    pub async fn wait_for_deliveries(&self, n: usize) -> Vec<SentDelivery> {
        for _ in 0..100 {
            let sent = self.deliveries();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.deliveries()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn request_token(&self, _user: &User) -> WorkersResult<TokenGrant> {
        let mut state = self.state.lock().unwrap();
        state.token_requests += 1;
        Ok(TokenGrant {
            access_token: format!("issued-token-{}", state.token_requests),
            expires_in: 3600,
        })
    }

    async fn deliver(
        &self,
        user: &User,
        token: &str,
        delivery: &Delivery,
    ) -> WorkersResult<DeliveryOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deliveries {
            return Err(unavailable("upstream"));
        }
        state.deliveries.push(SentDelivery {
            username: user.username.clone(),
            token: token.to_string(),
            delivery: delivery.clone(),
        });
        if state.reject_all || state.rejected.contains(token) {
            return Ok(DeliveryOutcome::Unauthorized);
        }
        Ok(DeliveryOutcome::Delivered)
    }
}
