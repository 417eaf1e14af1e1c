use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the workers database.
///
/// Wraps `WorkersDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. The mutex also serializes the
/// check-and-set updates that guard job and build completion.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<WorkersDb>>,
}

impl DbHandle {
    pub fn new(db: WorkersDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&WorkersDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, WorkersDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Outcome of a project sync upsert.
#[derive(Debug)]
pub enum SyncOutcome {
    Created(Project),
    Updated(Project),
    /// Another user already owns this owner/title pair.
    OwnedByOther,
}

/// Field updates applied to an unfinished build while polling.
#[derive(Debug, Clone)]
pub struct BuildProgress {
    pub provider_data: BuildProviderData,
    pub status: BuildStatus,
    pub failed_at_stage: Option<BuildStage>,
    pub image_tag: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct WorkersDb {
    conn: Connection,
}

impl WorkersDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    url TEXT NOT NULL,
                    client_id TEXT NOT NULL,
                    client_secret TEXT NOT NULL,
                    api_token TEXT NOT NULL UNIQUE,
                    access_token TEXT,
                    access_token_expires_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    owner TEXT NOT NULL,
                    title TEXT NOT NULL,
                    tech TEXT NOT NULL,
                    callable_name TEXT,
                    cpu REAL,
                    memory REAL,
                    repo_url TEXT NOT NULL,
                    repo_tag TEXT NOT NULL,
                    latest_tag TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(owner, title)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    task_name TEXT NOT NULL,
                    tag TEXT NOT NULL,
                    inputs TEXT NOT NULL,
                    outputs TEXT,
                    status TEXT NOT NULL DEFAULT 'CREATED',
                    created_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS builds (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    provider TEXT NOT NULL,
                    provider_data TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'created',
                    failed_at_stage TEXT,
                    image_tag TEXT,
                    version TEXT,
                    created_at TEXT NOT NULL,
                    finished_at TEXT,
                    cancelled_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_projects_user ON projects(user_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
                CREATE INDEX IF NOT EXISTS idx_builds_project ON builds(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        username: &str,
        url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<User> {
        let api_token = Uuid::new_v4().simple().to_string();
        self.conn
            .execute(
                "INSERT INTO users (username, url, client_id, client_secret, api_token, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![username, url, client_id, client_secret, api_token, Utc::now()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn get_user_by_api_token(&self, api_token: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE api_token = ?1", USER_COLUMNS),
                params![api_token],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by token")
    }

    pub fn update_user_access_token(
        &self,
        id: i64,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<User> {
        self.conn
            .execute(
                "UPDATE users SET access_token = ?1, access_token_expires_at = ?2 WHERE id = ?3",
                params![access_token, expires_at, id],
            )
            .context("Failed to update user access token")?;
        self.get_user(id)?
            .context("User not found after token update")
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Insert or update a project keyed by (owner, title).
    pub fn upsert_project(&self, user_id: i64, sync: &ProjectSync) -> Result<SyncOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = Utc::now();

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, user_id FROM projects WHERE owner = ?1 AND title = ?2",
                params![sync.owner, sync.title],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to look up project")?;

        let (id, created) = match existing {
            Some((_, owner_id)) if owner_id != user_id => return Ok(SyncOutcome::OwnedByOther),
            Some((id, _)) => {
                tx.execute(
                    "UPDATE projects SET tech = ?1, callable_name = ?2, cpu = ?3, memory = ?4,
                        repo_url = ?5, repo_tag = ?6, latest_tag = COALESCE(?7, latest_tag),
                        updated_at = ?8
                     WHERE id = ?9",
                    params![
                        sync.tech.as_str(),
                        sync.callable_name,
                        sync.cpu,
                        sync.memory,
                        sync.repo_url,
                        sync.repo_tag,
                        sync.latest_tag,
                        now,
                        id
                    ],
                )
                .context("Failed to update project")?;
                (id, false)
            }
            None => {
                tx.execute(
                    "INSERT INTO projects (user_id, owner, title, tech, callable_name, cpu, memory,
                        repo_url, repo_tag, latest_tag, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                    params![
                        user_id,
                        sync.owner,
                        sync.title,
                        sync.tech.as_str(),
                        sync.callable_name,
                        sync.cpu,
                        sync.memory,
                        sync.repo_url,
                        sync.repo_tag,
                        sync.latest_tag,
                        now
                    ],
                )
                .context("Failed to insert project")?;
                (tx.last_insert_rowid(), true)
            }
        };

        tx.commit().context("Failed to commit project sync")?;
        let project = self
            .get_project(id)?
            .context("Project not found after sync")?;
        Ok(if created {
            SyncOutcome::Created(project)
        } else {
            SyncOutcome::Updated(project)
        })
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                ProjectRow::from_row,
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub fn get_project_by_name(&self, owner: &str, title: &str) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM projects WHERE owner = ?1 AND title = ?2",
                    PROJECT_COLUMNS
                ),
                params![owner, title],
                ProjectRow::from_row,
            )
            .optional()
            .context("Failed to query project by name")?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub fn list_projects(&self, user_id: i64, limit: i64, offset: i64) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM projects WHERE user_id = ?1 ORDER BY owner, title LIMIT ?2 OFFSET ?3",
                PROJECT_COLUMNS
            ))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![user_id, limit, offset], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            let r = row.context("Failed to read project row")?;
            projects.push(r.into_project()?);
        }
        Ok(projects)
    }

    pub fn count_projects(&self, user_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count projects")
    }

    pub fn update_project_latest_tag(&self, id: i64, tag: &str) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET latest_tag = ?1, updated_at = ?2 WHERE id = ?3",
                params![tag, Utc::now(), id],
            )
            .context("Failed to update project tag")?;
        self.get_project(id)?
            .context("Project not found after tag update")
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        user_id: i64,
        project_id: i64,
        task_name: &str,
        tag: &str,
        inputs: &serde_json::Value,
    ) -> Result<Job> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO jobs (id, user_id, project_id, task_name, tag, inputs, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    user_id,
                    project_id,
                    task_name,
                    tag,
                    inputs,
                    JobStatus::Created.as_str(),
                    Utc::now()
                ],
            )
            .context("Failed to insert job")?;
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, project_id, task_name, tag, inputs, outputs, status, created_at, finished_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(JobRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        project_id: row.get(2)?,
                        task_name: row.get(3)?,
                        tag: row.get(4)?,
                        inputs: row.get(5)?,
                        outputs: row.get(6)?,
                        status: row.get(7)?,
                        created_at: row.get(8)?,
                        finished_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    /// `CREATED → RUNNING`. Returns false when the job was not in `CREATED`.
    pub fn mark_job_running(&self, id: Uuid) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![
                    JobStatus::Running.as_str(),
                    id.to_string(),
                    JobStatus::Created.as_str()
                ],
            )
            .context("Failed to mark job running")?;
        Ok(count > 0)
    }

    /// `RUNNING → {SUCCESS, FAIL}` guarded by `finished_at IS NULL`.
    /// Returns false when the precondition did not hold and nothing changed.
    pub fn complete_job(
        &self,
        id: Uuid,
        outputs: &serde_json::Value,
        status: JobStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        anyhow::ensure!(status.is_terminal(), "completion status must be terminal");
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET outputs = ?1, status = ?2, finished_at = ?3
                 WHERE id = ?4 AND status = ?5 AND finished_at IS NULL",
                params![
                    outputs,
                    status.as_str(),
                    finished_at,
                    id.to_string(),
                    JobStatus::Running.as_str()
                ],
            )
            .context("Failed to complete job")?;
        Ok(count > 0)
    }

    /// Finalize a job whose workload could not be submitted.
    ///
    /// This is the only CREATED → FAIL transition that skips the first poll.
    /// Every other job leaves CREATED through [`Self::mark_job_running`] on its
    /// first poll. Only jobs still in CREATED are touched.
    pub fn fail_unsubmitted_job(&self, id: Uuid, outputs: &serde_json::Value) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET outputs = ?1, status = ?2, finished_at = ?3
                 WHERE id = ?4 AND status = ?5 AND finished_at IS NULL",
                params![
                    outputs,
                    JobStatus::Fail.as_str(),
                    Utc::now(),
                    id.to_string(),
                    JobStatus::Created.as_str()
                ],
            )
            .context("Failed to mark job failed")?;
        Ok(count > 0)
    }

    // ── Builds ────────────────────────────────────────────────────────

    pub fn create_build(
        &self,
        project_id: i64,
        provider: BuildProvider,
        provider_data: &BuildProviderData,
    ) -> Result<Build> {
        let data = serde_json::to_value(provider_data).context("Failed to encode provider data")?;
        self.conn
            .execute(
                "INSERT INTO builds (project_id, provider, provider_data, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project_id,
                    provider.as_str(),
                    data,
                    BuildStatus::Created.as_str(),
                    Utc::now()
                ],
            )
            .context("Failed to insert build")?;
        let id = self.conn.last_insert_rowid();
        self.get_build(id)?.context("Build not found after insert")
    }

    pub fn get_build(&self, id: i64) -> Result<Option<Build>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, provider, provider_data, status, failed_at_stage, image_tag,
                        version, created_at, finished_at, cancelled_at
                 FROM builds WHERE id = ?1",
                params![id],
                |row| {
                    Ok(BuildRow {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        provider: row.get(2)?,
                        provider_data: row.get(3)?,
                        status: row.get(4)?,
                        failed_at_stage: row.get(5)?,
                        image_tag: row.get(6)?,
                        version: row.get(7)?,
                        created_at: row.get(8)?,
                        finished_at: row.get(9)?,
                        cancelled_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .context("Failed to query build")?;
        row.map(BuildRow::into_build).transpose()
    }

    /// Apply poll results to a build that has not finished yet.
    /// Returns false (and changes nothing) once `finished_at` is set.
    ///
    /// The stored stage is advanced, never replaced: a poll that observed
    /// older CI state cannot move the build backwards.
    pub fn record_build_progress(&self, id: i64, progress: &BuildProgress) -> Result<bool> {
        let Some(current) = self.get_build(id)? else {
            return Ok(false);
        };
        if current.finished_at.is_some() {
            return Ok(false);
        }
        let mut provider_data = progress.provider_data.clone();
        provider_data.stage = current.stage().advance(provider_data.stage);
        if provider_data.run_id.is_none() {
            provider_data.run_id = current.provider_data.run_id;
        }
        let status = match (current.status, progress.status) {
            (BuildStatus::Running, BuildStatus::Created) => BuildStatus::Running,
            (_, observed) => observed,
        };
        let data =
            serde_json::to_value(&provider_data).context("Failed to encode provider data")?;
        let count = self
            .conn
            .execute(
                "UPDATE builds SET provider_data = ?1, status = ?2, failed_at_stage = ?3,
                    image_tag = COALESCE(?4, image_tag), finished_at = ?5
                 WHERE id = ?6 AND finished_at IS NULL",
                params![
                    data,
                    status.as_str(),
                    progress.failed_at_stage.map(|s| s.as_str()),
                    progress.image_tag,
                    progress.finished_at,
                    id
                ],
            )
            .context("Failed to update build progress")?;
        Ok(count > 0)
    }

    /// Mark an unfinished build cancelled. Returns false once it already finished.
    pub fn cancel_build(
        &self,
        id: i64,
        provider_data: &BuildProviderData,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let data =
            serde_json::to_value(provider_data).context("Failed to encode provider data")?;
        let count = self
            .conn
            .execute(
                "UPDATE builds SET provider_data = ?1, status = ?2, cancelled_at = ?3, finished_at = ?3
                 WHERE id = ?4 AND finished_at IS NULL",
                params![data, BuildStatus::Cancelled.as_str(), at, id],
            )
            .context("Failed to cancel build")?;
        Ok(count > 0)
    }

    /// Record promotion results. Allowed after the build finished.
    pub fn set_build_artifacts(
        &self,
        id: i64,
        provider_data: &BuildProviderData,
        image_tag: Option<&str>,
        version: Option<&str>,
    ) -> Result<Build> {
        let data =
            serde_json::to_value(provider_data).context("Failed to encode provider data")?;
        self.conn
            .execute(
                "UPDATE builds SET provider_data = ?1, image_tag = COALESCE(?2, image_tag),
                    version = COALESCE(?3, version)
                 WHERE id = ?4",
                params![data, image_tag, version, id],
            )
            .context("Failed to update build artifacts")?;
        self.get_build(id)?
            .context("Build not found after artifact update")
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

const USER_COLUMNS: &str = "id, username, url, client_id, client_secret, api_token, access_token, access_token_expires_at, created_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        url: row.get(2)?,
        client_id: row.get(3)?,
        client_secret: row.get(4)?,
        api_token: row.get(5)?,
        access_token: row.get(6)?,
        access_token_expires_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const PROJECT_COLUMNS: &str = "id, user_id, owner, title, tech, callable_name, cpu, memory, repo_url, repo_tag, latest_tag, created_at, updated_at";

/// Intermediate row struct for projects.
struct ProjectRow {
    id: i64,
    user_id: i64,
    owner: String,
    title: String,
    tech: String,
    callable_name: Option<String>,
    cpu: Option<f64>,
    memory: Option<f64>,
    repo_url: String,
    repo_tag: String,
    latest_tag: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            owner: row.get(2)?,
            title: row.get(3)?,
            tech: row.get(4)?,
            callable_name: row.get(5)?,
            cpu: row.get(6)?,
            memory: row.get(7)?,
            repo_url: row.get(8)?,
            repo_tag: row.get(9)?,
            latest_tag: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let tech = TechKind::from_str(&self.tech)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse project tech")?;
        Ok(Project {
            id: self.id,
            user_id: self.user_id,
            owner: self.owner,
            title: self.title,
            tech,
            callable_name: self.callable_name,
            cpu: self.cpu,
            memory: self.memory,
            repo_url: self.repo_url,
            repo_tag: self.repo_tag,
            latest_tag: self.latest_tag,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: String,
    user_id: i64,
    project_id: i64,
    task_name: String,
    tag: String,
    inputs: serde_json::Value,
    outputs: Option<serde_json::Value>,
    status: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let id = Uuid::parse_str(&self.id).context("Failed to parse job id")?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        Ok(Job {
            id,
            user_id: self.user_id,
            project_id: self.project_id,
            task_name: self.task_name,
            tag: self.tag,
            inputs: self.inputs,
            outputs: self.outputs,
            status,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}

/// Intermediate row struct for builds.
struct BuildRow {
    id: i64,
    project_id: i64,
    provider: String,
    provider_data: serde_json::Value,
    status: String,
    failed_at_stage: Option<String>,
    image_tag: Option<String>,
    version: Option<String>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl BuildRow {
    fn into_build(self) -> Result<Build> {
        let provider = BuildProvider::from_str(&self.provider)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse build provider")?;
        let status = BuildStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse build status")?;
        let failed_at_stage = self
            .failed_at_stage
            .as_deref()
            .map(BuildStage::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse failed_at_stage")?;
        let provider_data: BuildProviderData = serde_json::from_value(self.provider_data)
            .context("Failed to parse build provider data")?;
        Ok(Build {
            id: self.id,
            project_id: self.project_id,
            provider,
            provider_data,
            status,
            failed_at_stage,
            image_tag: self.image_tag,
            version: self.version,
            created_at: self.created_at,
            finished_at: self.finished_at,
            cancelled_at: self.cancelled_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
