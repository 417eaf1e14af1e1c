use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use super::builds::{BuildPipeline, Promotion, PublishTarget};
use super::cluster::Cluster;
use super::db::DbHandle;
use super::deployments::DeploymentController;
use super::github::GitHub;
use super::jobs::JobController;
use super::manifests::SpecBuilder;
use super::models::{JobStatus, ProjectSync, User};
use super::projects;
use super::relay::{CallbackRelay, Upstream};
use super::secrets::{ClusterSecrets, SecretInjector};
use crate::errors::WorkersError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub jobs: JobController,
    pub deployments: DeploymentController,
    pub builds: BuildPipeline,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the controllers around one set of external clients.
    pub fn new(
        db: DbHandle,
        cluster: Arc<dyn Cluster>,
        github: Arc<dyn GitHub>,
        upstream: Arc<dyn Upstream>,
        specs: SpecBuilder,
        target: PublishTarget,
    ) -> Self {
        let specs = Arc::new(specs);
        let secrets = SecretInjector::new(Arc::new(ClusterSecrets::new(cluster.clone())));
        let relay = CallbackRelay::new(db.clone(), upstream);
        Self {
            jobs: JobController::new(
                db.clone(),
                cluster.clone(),
                secrets.clone(),
                specs.clone(),
                relay.clone(),
            ),
            deployments: DeploymentController::new(cluster, secrets, specs),
            builds: BuildPipeline::new(db.clone(), github, relay, target),
            db,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub task_name: String,
    #[serde(default)]
    pub task_kwargs: serde_json::Value,
    /// Image tag to run; defaults to the project's promoted tag.
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Deserialize)]
pub struct CompleteJobRequest {
    pub status: JobStatus,
    #[serde(default)]
    pub outputs: serde_json::Value,
}

#[derive(Deserialize)]
pub struct CreateDeploymentRequest {
    pub deployment_name: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unauthorized(String),
    BadGateway(String),
    Unavailable(String),
    Internal(String),
}

impl From<WorkersError> for ApiError {
    fn from(err: WorkersError) -> Self {
        let msg = err.to_string();
        match err {
            WorkersError::NotFound { .. } => ApiError::NotFound(msg),
            WorkersError::Conflict(_) => ApiError::Conflict(msg),
            WorkersError::BadRequest(_) | WorkersError::InvalidResource(_) => {
                ApiError::BadRequest(msg)
            }
            WorkersError::Unauthorized => ApiError::Unauthorized(msg),
            WorkersError::TransientInfra { .. } => ApiError::Unavailable(msg),
            WorkersError::UpstreamAuth(_) => ApiError::BadGateway(msg),
            WorkersError::Database(e) | WorkersError::Other(e) => {
                error!(error = ?e, "Request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Authentication ────────────────────────────────────────────────────

/// The registered webapp identified by the request's bearer token.
pub struct Caller(pub User);

/// Like [`Caller`], but a request without a token is allowed through.
/// A token that is present but unknown is still rejected.
pub struct MaybeCaller(pub Option<User>);

fn bearer_token(parts: &Parts) -> Result<Option<String>, ApiError> {
    let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| Some(t.trim().to_string()))
        .ok_or_else(|| ApiError::from(WorkersError::Unauthorized))
}

async fn user_for_token(state: &SharedState, token: String) -> Result<User, ApiError> {
    state
        .db
        .call(move |db| db.get_user_by_api_token(&token))
        .await
        .map_err(WorkersError::Database)?
        .ok_or_else(|| ApiError::from(WorkersError::Unauthorized))
}

impl FromRequestParts<SharedState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?.ok_or_else(|| ApiError::from(WorkersError::Unauthorized))?;
        Ok(Caller(user_for_token(state, token).await?))
    }
}

impl FromRequestParts<SharedState> for MaybeCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        match bearer_token(parts)? {
            Some(token) => Ok(MaybeCaller(Some(user_for_token(state, token).await?))),
            None => Ok(MaybeCaller(None)),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/jobs/callback/{job_id}/", get(poll_job).post(complete_job))
        .route("/jobs/{owner}/{title}/", post(create_job))
        .route("/deployments/{owner}/{title}/", post(create_deployment))
        .route(
            "/deployments/{owner}/{title}/{name}/",
            get(get_deployment).delete(delete_deployment),
        )
        // One parameter name per position: `{key}` is a build id on the
        // first two routes and a project owner on the third.
        .route("/builds/{key}/", get(poll_build).delete(cancel_build))
        .route("/builds/{key}/done/", post(finish_build))
        .route("/builds/{key}/{title}/", post(create_build))
        .route("/projects/sync/", post(sync_projects))
        .route("/projects/", get(list_projects))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path((owner, title)): Path<(String, String)>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::project_for(&state.db, &caller, &owner, &title).await?;
    let tag = req
        .tag
        .or_else(|| project.latest_tag.clone())
        .ok_or_else(|| {
            WorkersError::BadRequest(format!("{} has no published image tag", project.full_name()))
        })?;
    let job = state
        .jobs
        .create_job(&project, &req.task_name, req.task_kwargs, &tag)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn poll_job(
    State(state): State<SharedState>,
    MaybeCaller(caller): MaybeCaller,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.jobs.poll_job(job_id, caller.as_ref()).await?;
    Ok(Json(job))
}

async fn complete_job(
    State(state): State<SharedState>,
    MaybeCaller(caller): MaybeCaller,
    Path(job_id): Path<Uuid>,
    Json(req): Json<CompleteJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .jobs
        .complete_job(job_id, caller.as_ref(), req.outputs, req.status)
        .await?;
    Ok(Json(job))
}

async fn create_deployment(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path((owner, title)): Path<(String, String)>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::project_for(&state.db, &caller, &owner, &title).await?;
    let tag = req
        .tag
        .or_else(|| project.latest_tag.clone())
        .ok_or_else(|| {
            WorkersError::BadRequest(format!("{} has no published image tag", project.full_name()))
        })?;
    let report = state
        .deployments
        .create_deployment(&project, &tag, &req.deployment_name)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn get_deployment(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path((owner, title, name)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::project_for(&state.db, &caller, &owner, &title).await?;
    let report = state.deployments.get_deployment(&project, &name).await?;
    Ok(Json(report))
}

async fn delete_deployment(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path((owner, title, name)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::project_for(&state.db, &caller, &owner, &title).await?;
    let report = state.deployments.delete_deployment(&project, &name).await?;
    Ok(Json(report))
}

async fn create_build(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path((owner, title)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = projects::project_for(&state.db, &caller, &owner, &title).await?;
    let build = state.builds.create_build(&project).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

fn parse_build_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid build id {:?}", raw)))
}

async fn poll_build(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state.builds.poll_build(parse_build_id(&key)?, &caller).await?;
    Ok(Json(build))
}

async fn cancel_build(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state.builds.cancel_build(parse_build_id(&key)?, &caller).await?;
    Ok(Json(build))
}

async fn finish_build(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Path(key): Path<String>,
    body: Option<Json<Promotion>>,
) -> Result<impl IntoResponse, ApiError> {
    let promotion = body.map(|Json(p)| p).unwrap_or_default();
    let build = state
        .builds
        .finish_build(parse_build_id(&key)?, &caller, promotion)
        .await?;
    Ok(Json(build))
}

async fn sync_projects(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Json(projects): Json<Vec<ProjectSync>>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = projects::sync_projects(&state.db, &caller, projects).await?;
    Ok(Json(summary))
}

async fn list_projects(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = projects::list_projects(&state.db, &caller, query.page.unwrap_or(1)).await?;
    Ok(Json(page))
}

// ── Tests ─────────────────────────────────────────────────────────────
