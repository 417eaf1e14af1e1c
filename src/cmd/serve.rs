//! HTTP API server command: `cs-workers serve`.

use std::path::PathBuf;

use anyhow::Result;
use cs_workers::config::WorkersConfig;
use cs_workers::workers::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    mut config: WorkersConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    config.database.path = super::resolve_db_path(&config, db_path);

    start_server(ServerConfig::from_workers(config)).await
}
