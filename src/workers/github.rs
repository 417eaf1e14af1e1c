//! GitHub REST client for driving CI builds.
//!
//! Only the operations the build pipeline uses: branch refs, one file's
//! contents, pull requests, workflow runs and their jobs, job logs.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GitHubSection;
use crate::errors::{WorkersError, WorkersResult};

const SERVICE: &str = "github";
const USER_AGENT: &str = concat!("cs-workers/", env!("CARGO_PKG_VERSION"));

/// Repository the pipeline publishes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequestHead {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

/// A pull request (subset of fields).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub html_url: String,
    pub head: PullRequestHead,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub id: u64,
    pub status: String,
    pub conclusion: Option<String>,
    pub head_branch: Option<String>,
    pub head_sha: String,
    pub event: String,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowJob {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

/// A file to create or update on a branch.
#[derive(Debug, Clone)]
pub struct FileWrite {
    pub path: String,
    pub branch: String,
    pub message: String,
    pub content: String,
    /// Blob SHA of the current file; required by GitHub when updating.
    pub sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct ContentMeta {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentPutResponse {
    commit: ContentMeta,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<WorkflowJob>,
}

#[derive(Debug, Serialize)]
struct ContentPut<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[async_trait]
pub trait GitHub: Send + Sync {
    /// Head commit of `branch`, or `None` if the branch doesn't exist.
    async fn branch_sha(&self, repo: &RepoRef, branch: &str) -> WorkersResult<Option<String>>;
    async fn create_branch(&self, repo: &RepoRef, branch: &str, sha: &str) -> WorkersResult<()>;
    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> WorkersResult<bool>;

    async fn file_sha(
        &self,
        repo: &RepoRef,
        path: &str,
        branch: &str,
    ) -> WorkersResult<Option<String>>;
    /// Create or update one file; returns the SHA of the resulting commit.
    async fn put_file(&self, repo: &RepoRef, file: &FileWrite) -> WorkersResult<String>;

    async fn open_pull_requests(&self, repo: &RepoRef) -> WorkersResult<Vec<PullRequest>>;
    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        pr: &NewPullRequest,
    ) -> WorkersResult<PullRequest>;
    async fn merge_pull_request(&self, repo: &RepoRef, number: u64) -> WorkersResult<()>;

    async fn workflow_runs(
        &self,
        repo: &RepoRef,
        branch: &str,
        event: &str,
    ) -> WorkersResult<Vec<WorkflowRun>>;
    async fn run_jobs(&self, repo: &RepoRef, run_id: u64) -> WorkersResult<Vec<WorkflowJob>>;
    /// Raw job log text, or `None` once GitHub has expired it.
    async fn job_logs(&self, repo: &RepoRef, job_id: u64) -> WorkersResult<Option<String>>;
    async fn cancel_run(&self, repo: &RepoRef, run_id: u64) -> WorkersResult<()>;
}

/// The most recently created run, if any.
pub fn latest_run(runs: &[WorkflowRun]) -> Option<&WorkflowRun> {
    runs.iter().max_by_key(|run| run.created_at)
}

pub fn encode_content(content: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(content.as_bytes())
}

// ── REST client ───────────────────────────────────────────────────────

pub struct RestGitHub {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl RestGitHub {
    pub fn new(config: &GitHubSection) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build GitHub client")?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, repo: &RepoRef, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url,
            repo.owner,
            repo.name,
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        debug!(method = %method, url = %url, "GitHub request");
        let req = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> WorkersResult<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| WorkersError::from_transport(SERVICE, e))
    }

    /// Error out on any non-success status other than 404.
    async fn check(resp: reqwest::Response) -> WorkersResult<Option<reqwest::Response>> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkersError::from_status(SERVICE, status, &body));
        }
        Ok(Some(resp))
    }

    /// Like [`Self::check`] but 404 is an error too.
    async fn require(resp: reqwest::Response, what: &'static str) -> WorkersResult<reqwest::Response> {
        let url = resp.url().path().to_string();
        Self::check(resp)
            .await?
            .ok_or_else(|| WorkersError::not_found(what, url))
    }

    async fn json<T: DeserializeOwned>(resp: reqwest::Response) -> WorkersResult<T> {
        Ok(resp
            .json::<T>()
            .await
            .context("Failed to parse GitHub response")?)
    }
}

#[async_trait]
impl GitHub for RestGitHub {
    async fn branch_sha(&self, repo: &RepoRef, branch: &str) -> WorkersResult<Option<String>> {
        let url = self.url(repo, &format!("git/ref/heads/{}", branch));
        let resp = self.send(self.request(reqwest::Method::GET, &url)).await?;
        match Self::check(resp).await? {
            Some(resp) => Ok(Some(Self::json::<GitRef>(resp).await?.object.sha)),
            None => Ok(None),
        }
    }

    async fn create_branch(&self, repo: &RepoRef, branch: &str, sha: &str) -> WorkersResult<()> {
        let url = self.url(repo, "git/refs");
        let body = serde_json::json!({
            "ref": format!("refs/heads/{}", branch),
            "sha": sha,
        });
        let resp = self
            .send(self.request(reqwest::Method::POST, &url).json(&body))
            .await?;
        Self::require(resp, "Repository").await?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> WorkersResult<bool> {
        let url = self.url(repo, &format!("git/refs/heads/{}", branch));
        let resp = self
            .send(self.request(reqwest::Method::DELETE, &url))
            .await?;
        // GitHub answers 422 for a ref that is already gone.
        if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(false);
        }
        Ok(Self::check(resp).await?.is_some())
    }

    async fn file_sha(
        &self,
        repo: &RepoRef,
        path: &str,
        branch: &str,
    ) -> WorkersResult<Option<String>> {
        let url = self.url(repo, &format!("contents/{}", path));
        let resp = self
            .send(
                self.request(reqwest::Method::GET, &url)
                    .query(&[("ref", branch)]),
            )
            .await?;
        match Self::check(resp).await? {
            Some(resp) => Ok(Some(Self::json::<ContentMeta>(resp).await?.sha)),
            None => Ok(None),
        }
    }

    async fn put_file(&self, repo: &RepoRef, file: &FileWrite) -> WorkersResult<String> {
        let url = self.url(repo, &format!("contents/{}", file.path));
        let body = ContentPut {
            message: &file.message,
            content: encode_content(&file.content),
            branch: &file.branch,
            sha: file.sha.as_deref(),
        };
        let resp = self
            .send(self.request(reqwest::Method::PUT, &url).json(&body))
            .await?;
        let written: ContentPutResponse = Self::json(Self::require(resp, "Repository").await?).await?;
        Ok(written.commit.sha)
    }

    async fn open_pull_requests(&self, repo: &RepoRef) -> WorkersResult<Vec<PullRequest>> {
        let url = self.url(repo, "pulls");
        let resp = self
            .send(
                self.request(reqwest::Method::GET, &url)
                    .query(&[("state", "open"), ("per_page", "100")]),
            )
            .await?;
        Self::json(Self::require(resp, "Repository").await?).await
    }

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        pr: &NewPullRequest,
    ) -> WorkersResult<PullRequest> {
        let url = self.url(repo, "pulls");
        let resp = self
            .send(self.request(reqwest::Method::POST, &url).json(pr))
            .await?;
        Self::json(Self::require(resp, "Repository").await?).await
    }

    async fn merge_pull_request(&self, repo: &RepoRef, number: u64) -> WorkersResult<()> {
        let url = self.url(repo, &format!("pulls/{}/merge", number));
        let body = serde_json::json!({ "merge_method": "squash" });
        let resp = self
            .send(self.request(reqwest::Method::PUT, &url).json(&body))
            .await?;
        Self::require(resp, "Pull request").await?;
        Ok(())
    }

    async fn workflow_runs(
        &self,
        repo: &RepoRef,
        branch: &str,
        event: &str,
    ) -> WorkersResult<Vec<WorkflowRun>> {
        let url = self.url(repo, "actions/runs");
        let resp = self
            .send(
                self.request(reqwest::Method::GET, &url)
                    .query(&[("branch", branch), ("event", event)]),
            )
            .await?;
        let page: RunsPage = Self::json(Self::require(resp, "Repository").await?).await?;
        Ok(page.workflow_runs)
    }

    async fn run_jobs(&self, repo: &RepoRef, run_id: u64) -> WorkersResult<Vec<WorkflowJob>> {
        let url = self.url(repo, &format!("actions/runs/{}/jobs", run_id));
        let resp = self.send(self.request(reqwest::Method::GET, &url)).await?;
        let page: JobsPage = Self::json(Self::require(resp, "Workflow run").await?).await?;
        Ok(page.jobs)
    }

    async fn job_logs(&self, repo: &RepoRef, job_id: u64) -> WorkersResult<Option<String>> {
        let url = self.url(repo, &format!("actions/jobs/{}/logs", job_id));
        let resp = self.send(self.request(reqwest::Method::GET, &url)).await?;
        if resp.status() == reqwest::StatusCode::GONE {
            return Ok(None);
        }
        match Self::check(resp).await? {
            Some(resp) => Ok(Some(
                resp.text()
                    .await
                    .map_err(|e| WorkersError::from_transport(SERVICE, e))?,
            )),
            None => Ok(None),
        }
    }

    async fn cancel_run(&self, repo: &RepoRef, run_id: u64) -> WorkersResult<()> {
        let url = self.url(repo, &format!("actions/runs/{}/cancel", run_id));
        let resp = self
            .send(self.request(reqwest::Method::POST, &url))
            .await?;
        Self::require(resp, "Workflow run").await?;
        Ok(())
    }
}
