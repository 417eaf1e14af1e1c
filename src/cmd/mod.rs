//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `init_db` | `InitDb`         |
//! | `users`   | `Users`          |

pub mod init_db;
pub mod serve;
pub mod users;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cs_workers::config::WorkersConfig;

pub use init_db::cmd_init_db;
pub use serve::cmd_serve;
pub use users::cmd_users;

/// Config file plus environment overrides. CLI flags are applied by each command.
pub fn load_config(path: &Path) -> Result<WorkersConfig> {
    WorkersConfig::load_with_env(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

/// `--db-path` wins over the configured path.
pub fn resolve_db_path(config: &WorkersConfig, flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| config.database.path.clone())
}

/// Open the database, creating its parent directory if needed.
pub fn open_db(path: &Path) -> Result<cs_workers::workers::db::WorkersDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    cs_workers::workers::db::WorkersDb::new(path)
        .with_context(|| format!("Failed to open database {}", path.display()))
}
