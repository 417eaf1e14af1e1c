use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::api::{self, AppState};
use super::builds::PublishTarget;
use super::cluster::KubeClient;
use super::db::{DbHandle, WorkersDb};
use super::github::{RepoRef, RestGitHub};
use super::manifests::SpecBuilder;
use super::relay::HttpUpstream;
use crate::config::WorkersConfig;

/// Everything needed to start serving, resolved from config and CLI flags.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub workers: WorkersConfig,
}

impl ServerConfig {
    pub fn from_workers(workers: WorkersConfig) -> Self {
        Self {
            host: workers.server.host.clone(),
            port: workers.server.port,
            db_path: workers.database.path.clone(),
            workers,
        }
    }
}

/// Build the full application router with request tracing.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Construct the live clients and controllers described by `config`.
pub fn build_state(config: &WorkersConfig, db: DbHandle) -> Result<AppState> {
    let cluster = KubeClient::new(&config.cluster).context("Failed to build cluster client")?;
    let github = RestGitHub::new(&config.github).context("Failed to build GitHub client")?;
    let upstream =
        HttpUpstream::new(config.upstream.timeout_secs).context("Failed to build upstream client")?;

    let specs = SpecBuilder {
        namespace: config.cluster.namespace.clone(),
        image_registry: config.cluster.image_registry.clone(),
        public_url: config.server.public_url.clone(),
        viz_host: config.cluster.viz_host.clone(),
    };
    let target = PublishTarget {
        repo: RepoRef {
            owner: config.github.repo_owner.clone(),
            name: config.github.repo_name.clone(),
        },
        primary_branch: config.github.primary_branch.clone(),
        config_dir: config.github.config_dir.clone(),
    };

    Ok(AppState::new(
        db,
        Arc::new(cluster),
        Arc::new(github),
        Arc::new(upstream),
        specs,
        target,
    ))
}

/// Start the workers server and block until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = WorkersDb::new(&config.db_path).context("Failed to initialize workers database")?;
    let state = build_state(&config.workers, DbHandle::new(db))?;
    let app = build_router(Arc::new(state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, namespace = %config.workers.cluster.namespace, "Workers API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}
