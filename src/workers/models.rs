use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workers::logs::LogSection;

// ── Users ─────────────────────────────────────────────────────────────

/// An upstream web application registered with this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Base URL of the upstream webapp; results are relayed here.
    pub url: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// True when no bearer token is cached or the cached one expires within `leeway`.
    pub fn token_needs_refresh(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        match (&self.access_token, self.access_token_expires_at) {
            (Some(_), Some(expires_at)) => expires_at - now <= leeway,
            _ => true,
        }
    }
}

// ── Projects ──────────────────────────────────────────────────────────

/// Technology a project is published with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TechKind {
    #[serde(rename = "python-paramtools")]
    Batch,
    #[serde(rename = "dash")]
    DashApp,
    #[serde(rename = "bokeh")]
    BokehApp,
}

impl TechKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "python-paramtools",
            Self::DashApp => "dash",
            Self::BokehApp => "bokeh",
        }
    }

    pub fn is_viz(&self) -> bool {
        matches!(self, Self::DashApp | Self::BokehApp)
    }
}

impl FromStr for TechKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python-paramtools" | "batch" => Ok(Self::Batch),
            "dash" => Ok(Self::DashApp),
            "bokeh" => Ok(Self::BokehApp),
            _ => Err(format!("Invalid tech: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub user_id: i64,
    pub owner: String,
    pub title: String,
    pub tech: TechKind,
    pub callable_name: Option<String>,
    /// Declared CPU request in cores. `None` when upstream never supplied one.
    pub cpu: Option<f64>,
    /// Declared memory request in GiB.
    pub memory: Option<f64>,
    pub repo_url: String,
    pub repo_tag: String,
    /// Image tag promoted by the last successful build.
    pub latest_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.title)
    }
}

/// Project metadata as pushed by the upstream webapp on sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSync {
    pub owner: String,
    pub title: String,
    pub tech: TechKind,
    #[serde(default)]
    pub callable_name: Option<String>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    pub repo_url: String,
    #[serde(default = "default_repo_tag")]
    pub repo_tag: String,
    #[serde(default)]
    pub latest_tag: Option<String>,
}

fn default_repo_tag() -> String {
    "master".to_string()
}

// ── Jobs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Running,
    Success,
    Fail,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: i64,
    pub project_id: i64,
    pub task_name: String,
    pub tag: String,
    pub inputs: serde_json::Value,
    pub outputs: Option<serde_json::Value>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ── Builds ────────────────────────────────────────────────────────────

/// Pipeline stage of a build. Ordered; see [`BuildStage::advance`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Started,
    Staging,
    Building,
    Testing,
    Pushing,
    Success,
    Failure,
    Cancelled,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Staging => "staging",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Pushing => "pushing",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Started => 0,
            Self::Staging => 1,
            Self::Building => 2,
            Self::Testing => 3,
            Self::Pushing => 4,
            Self::Success | Self::Failure | Self::Cancelled => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 5
    }

    /// Move to `observed` only if it does not go backwards. Terminal stages absorb.
    pub fn advance(self, observed: BuildStage) -> BuildStage {
        if self.is_terminal() || observed.rank() < self.rank() {
            self
        } else {
            observed
        }
    }
}

impl FromStr for BuildStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "staging" => Ok(Self::Staging),
            "building" => Ok(Self::Building),
            "testing" => Ok(Self::Testing),
            "pushing" => Ok(Self::Pushing),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid build stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Created,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildProvider {
    Github,
}

impl BuildProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
        }
    }
}

impl FromStr for BuildProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            _ => Err(format!("Invalid build provider: {}", s)),
        }
    }
}

/// CI-side correlation data for a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildProviderData {
    pub repo_owner: String,
    pub repo_name: String,
    pub branch: String,
    pub pull_request: Option<u64>,
    /// Commit that carries this build's config change. Only runs for this
    /// commit are attributed to the build.
    #[serde(default)]
    pub head_sha: Option<String>,
    #[serde(default)]
    pub run_id: Option<u64>,
    pub stage: BuildStage,
    /// Set once the build's pull request has been merged on promotion.
    #[serde(default)]
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogSection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub project_id: i64,
    pub provider: BuildProvider,
    pub provider_data: BuildProviderData,
    pub status: BuildStatus,
    pub failed_at_stage: Option<BuildStage>,
    pub image_tag: Option<String>,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn stage(&self) -> BuildStage {
        self.provider_data.stage
    }
}

// ── Deployments ───────────────────────────────────────────────────────

/// Live state of one orchestrator resource backing a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceStatus {
    pub ready: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    pub fn absent() -> Self {
        Self {
            ready: false,
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessReport {
    pub name: String,
    pub deployment: ResourceStatus,
    pub svc: ResourceStatus,
    pub ingressroute: ResourceStatus,
}

impl ReadinessReport {
    pub fn ready(&self) -> bool {
        self.deployment.ready && self.svc.ready && self.ingressroute.ready
    }
}

/// Which resources a delete call actually removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletionReport {
    pub name: String,
    pub deployment: bool,
    pub svc: bool,
    pub ingressroute: bool,
}
