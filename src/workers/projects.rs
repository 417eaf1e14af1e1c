//! Project metadata pushed by upstream webapps.

use serde::Serialize;
use tracing::{info, warn};

use super::db::{DbHandle, SyncOutcome};
use super::models::{Project, ProjectSync, User};
use crate::errors::{WorkersError, WorkersResult};

pub const PAGE_SIZE: i64 = 30;

#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    /// `owner/title` pairs already owned by another user; left untouched.
    pub rejected: Vec<String>,
    pub projects: Vec<Project>,
}

/// One page of a listing, in the shape upstream clients expect.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub count: i64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

fn validate(sync: &ProjectSync) -> WorkersResult<()> {
    for (field, value) in [("owner", &sync.owner), ("title", &sync.title)] {
        if value.trim().is_empty() {
            return Err(WorkersError::BadRequest(format!("{} is required", field)));
        }
        if value.contains('/') {
            return Err(WorkersError::BadRequest(format!(
                "{} {:?} may not contain '/'",
                field, value
            )));
        }
    }
    if sync.repo_url.trim().is_empty() {
        return Err(WorkersError::BadRequest("repo_url is required".into()));
    }
    Ok(())
}

/// Create or update each project. Re-syncing an existing (owner, title) updates it.
pub async fn sync_projects(
    db: &DbHandle,
    caller: &User,
    projects: Vec<ProjectSync>,
) -> WorkersResult<SyncSummary> {
    for sync in &projects {
        validate(sync)?;
    }
    let user_id = caller.id;
    let summary = db
        .call(move |db| {
            let mut summary = SyncSummary {
                created: 0,
                updated: 0,
                rejected: Vec::new(),
                projects: Vec::new(),
            };
            for sync in &projects {
                match db.upsert_project(user_id, sync)? {
                    SyncOutcome::Created(p) => {
                        summary.created += 1;
                        summary.projects.push(p);
                    }
                    SyncOutcome::Updated(p) => {
                        summary.updated += 1;
                        summary.projects.push(p);
                    }
                    SyncOutcome::OwnedByOther => {
                        summary
                            .rejected
                            .push(format!("{}/{}", sync.owner, sync.title));
                    }
                }
            }
            Ok(summary)
        })
        .await
        .map_err(WorkersError::Database)?;

    if !summary.rejected.is_empty() {
        warn!(user = %caller.username, rejected = ?summary.rejected, "Sync skipped projects owned by another user");
    }
    info!(
        user = %caller.username,
        created = summary.created,
        updated = summary.updated,
        "Synced projects"
    );
    Ok(summary)
}

/// `page` is 1-based. Pages past the end are NotFound, except page 1.
pub async fn list_projects(db: &DbHandle, caller: &User, page: i64) -> WorkersResult<Page<Project>> {
    if page < 1 {
        return Err(WorkersError::BadRequest("page must be >= 1".into()));
    }
    let offset = (page - 1)
        .checked_mul(PAGE_SIZE)
        .ok_or_else(|| WorkersError::not_found("Page", page))?;
    let user_id = caller.id;
    let (count, results) = db
        .call(move |db| {
            let count = db.count_projects(user_id)?;
            let results = db.list_projects(user_id, PAGE_SIZE, offset)?;
            Ok((count, results))
        })
        .await
        .map_err(WorkersError::Database)?;

    if page > 1 && offset >= count {
        return Err(WorkersError::not_found("Page", page));
    }
    let next = (offset + PAGE_SIZE < count).then(|| format!("/projects/?page={}", page + 1));
    let previous = (page > 1).then(|| format!("/projects/?page={}", page - 1));
    Ok(Page {
        count,
        next,
        previous,
        results,
    })
}

/// Look up `owner/title`, reporting other users' projects as missing.
pub async fn project_for(
    db: &DbHandle,
    caller: &User,
    owner: &str,
    title: &str,
) -> WorkersResult<Project> {
    let (o, t) = (owner.to_string(), title.to_string());
    db.call(move |db| db.get_project_by_name(&o, &t))
        .await
        .map_err(WorkersError::Database)?
        .filter(|p| p.user_id == caller.id)
        .ok_or_else(|| WorkersError::not_found("Project", format!("{}/{}", owner, title)))
}
