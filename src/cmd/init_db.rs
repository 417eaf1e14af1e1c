//! Schema setup command: `cs-workers init-db`.

use std::path::PathBuf;

use anyhow::Result;
use cs_workers::config::WorkersConfig;

pub fn cmd_init_db(config: &WorkersConfig, db_path: Option<PathBuf>) -> Result<()> {
    let path = super::resolve_db_path(config, db_path);
    super::open_db(&path)?;
    println!("Workers database initialized at {}", path.display());
    Ok(())
}
