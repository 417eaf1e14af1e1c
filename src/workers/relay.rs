//! Relays finished jobs and builds to the upstream webapp that owns them.
//!
//! Each user carries OAuth2 client credentials. Before posting we make sure
//! a bearer token is cached that stays valid for at least
//! [`TOKEN_REFRESH_LEEWAY_SECS`]; a refreshed token is persisted before the
//! post is attempted so a failed post does not cost another refresh.
//!
//! Background relays retry transient failures with exponential backoff
//! ([`RetryPolicy`]). Auth failures are not retried.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::db::DbHandle;
use super::models::{Build, Job, User};
use crate::errors::{WorkersError, WorkersResult};

pub const TOKEN_REFRESH_LEEWAY_SECS: i64 = 60;

const SERVICE: &str = "upstream";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    Put,
    Post,
}

/// One result to send upstream, relative to the user's webapp URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub method: DeliveryMethod,
    pub path: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The webapp rejected our bearer token.
    Unauthorized,
}

/// Transport to the upstream webapps.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn request_token(&self, user: &User) -> WorkersResult<TokenGrant>;
    async fn deliver(
        &self,
        user: &User,
        token: &str,
        delivery: &Delivery,
    ) -> WorkersResult<DeliveryOutcome>;
}

/// Route for a finished job's result.
pub fn job_delivery(job: &Job) -> Delivery {
    let path = match job.task_name.as_str() {
        "sim" => "/outputs/api/",
        "parse" => "/inputs/api/",
        _ => "/jobs/api/v1/results/",
    };
    Delivery {
        method: DeliveryMethod::Put,
        path: path.to_string(),
        body: serde_json::json!({
            "job_id": job.id,
            "task_name": job.task_name,
            "status": job.status,
            "outputs": job.outputs,
            "created_at": job.created_at,
            "finished_at": job.finished_at,
        }),
    }
}

pub fn build_delivery(build: &Build) -> WorkersResult<Delivery> {
    let body = serde_json::to_value(build).context("Failed to encode build")?;
    Ok(Delivery {
        method: DeliveryMethod::Put,
        path: format!("/projects/api/v1/builds/{}/", build.id),
        body,
    })
}

// ── HTTP transport ────────────────────────────────────────────────────

pub struct HttpUpstream {
    http: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(timeout_secs: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build upstream client")?;
        Ok(Self { http })
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn request_token(&self, user: &User) -> WorkersResult<TokenGrant> {
        let resp = self
            .http
            .post(join_url(&user.url, "/o/token/"))
            .basic_auth(&user.client_id, Some(&user.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| WorkersError::from_transport(SERVICE, e))?;
        let status = resp.status();
        if status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkersError::from_status(SERVICE, status, &body));
        }
        if !status.is_success() {
            return Err(WorkersError::UpstreamAuth(format!(
                "token request for {} returned {}",
                user.username, status
            )));
        }
        resp.json::<TokenGrant>()
            .await
            .map_err(|e| WorkersError::UpstreamAuth(format!("malformed token response: {}", e)))
    }

    async fn deliver(
        &self,
        user: &User,
        token: &str,
        delivery: &Delivery,
    ) -> WorkersResult<DeliveryOutcome> {
        let url = join_url(&user.url, &delivery.path);
        let req = match delivery.method {
            DeliveryMethod::Put => self.http.put(&url),
            DeliveryMethod::Post => self.http.post(&url),
        };
        let resp = req
            .bearer_auth(token)
            .json(&delivery.body)
            .send()
            .await
            .map_err(|e| WorkersError::from_transport(SERVICE, e))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(DeliveryOutcome::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkersError::from_status(SERVICE, status, &body));
        }
        Ok(DeliveryOutcome::Delivered)
    }
}

// ── Relay ─────────────────────────────────────────────────────────────

/// How often a background delivery is attempted before its result is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        self.base_delay.saturating_mul(1 << shift)
    }
}

#[derive(Clone)]
pub struct CallbackRelay {
    db: DbHandle,
    upstream: Arc<dyn Upstream>,
    retry: RetryPolicy,
}

impl CallbackRelay {
    pub fn new(db: DbHandle, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            db,
            upstream,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn load_user(&self, user_id: i64) -> WorkersResult<User> {
        self.db
            .call(move |db| db.get_user(user_id))
            .await
            .map_err(WorkersError::Database)?
            .ok_or_else(|| WorkersError::not_found("User", user_id))
    }

    async fn refresh(&self, user: &User) -> WorkersResult<(User, String)> {
        let grant = self.upstream.request_token(user).await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(grant.expires_in);
        let user_id = user.id;
        let token = grant.access_token.clone();
        let updated = self
            .db
            .call(move |db| db.update_user_access_token(user_id, &token, expires_at))
            .await
            .map_err(WorkersError::Database)?;
        info!(user = %updated.username, %expires_at, "Refreshed upstream access token");
        Ok((updated, grant.access_token))
    }

    /// Return a bearer token for `user_id`, refreshing it if missing or about to expire.
    pub async fn ensure_token(&self, user_id: i64) -> WorkersResult<(User, String)> {
        let user = self.load_user(user_id).await?;
        let leeway = chrono::Duration::seconds(TOKEN_REFRESH_LEEWAY_SECS);
        match &user.access_token {
            Some(token) if !user.token_needs_refresh(Utc::now(), leeway) => {
                let token = token.clone();
                Ok((user, token))
            }
            _ => self.refresh(&user).await,
        }
    }

    /// Send `delivery` to `user_id`'s webapp. A 401 triggers one refresh and one retry.
    pub async fn relay(&self, user_id: i64, delivery: &Delivery) -> WorkersResult<()> {
        let (user, token) = self.ensure_token(user_id).await?;
        match self.upstream.deliver(&user, &token, delivery).await? {
            DeliveryOutcome::Delivered => return Ok(()),
            DeliveryOutcome::Unauthorized => {
                warn!(user = %user.username, path = %delivery.path, "Upstream rejected token; refreshing");
            }
        }
        let (user, token) = self.refresh(&user).await?;
        match self.upstream.deliver(&user, &token, delivery).await? {
            DeliveryOutcome::Delivered => Ok(()),
            DeliveryOutcome::Unauthorized => Err(WorkersError::UpstreamAuth(format!(
                "{} rejected a freshly issued token",
                user.url
            ))),
        }
    }

    /// [`Self::relay`], repeated with backoff while the failure is transient.
    /// Each attempt re-reads the persisted token, so a token refreshed by an
    /// earlier attempt is reused.
    pub async fn relay_with_retry(&self, user_id: i64, delivery: &Delivery) -> WorkersResult<()> {
        let mut attempt = 1;
        loop {
            match self.relay(user_id, delivery).await {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        user_id,
                        path = %delivery.path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream delivery failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn relay_job(&self, job: &Job) -> WorkersResult<()> {
        self.relay_with_retry(job.user_id, &job_delivery(job)).await?;
        info!(job_id = %job.id, status = job.status.as_str(), "Relayed job result");
        Ok(())
    }

    pub async fn relay_build(&self, build: &Build, user_id: i64) -> WorkersResult<()> {
        self.relay_with_retry(user_id, &build_delivery(build)?).await?;
        info!(build_id = build.id, status = build.status.as_str(), "Relayed build");
        Ok(())
    }

    /// Fire-and-forget [`Self::relay_job`]; failures are logged.
    pub fn spawn_job(&self, job: Job) {
        let relay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.relay_job(&job).await {
                warn!(job_id = %job.id, error = %e, "Failed to relay job result");
            }
        });
    }

    /// Fire-and-forget [`Self::relay_build`]; failures are logged.
    pub fn spawn_build(&self, build: Build, user_id: i64) {
        let relay = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.relay_build(&build, user_id).await {
                warn!(build_id = build.id, error = %e, "Failed to relay build");
            }
        });
    }
}
