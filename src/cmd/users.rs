//! Webapp registration: `cs-workers users add`.

use anyhow::{Context, Result};
use cs_workers::config::WorkersConfig;

use crate::UsersCommands;

pub fn cmd_users(config: &WorkersConfig, command: UsersCommands) -> Result<()> {
    match command {
        UsersCommands::Add {
            username,
            url,
            client_id,
            client_secret,
            db_path,
        } => {
            let path = super::resolve_db_path(config, db_path);
            let db = super::open_db(&path)?;
            let user = db
                .create_user(&username, url.trim_end_matches('/'), &client_id, &client_secret)
                .with_context(|| format!("Could not register {}", username))?;
            println!("Registered {} (id {})", user.username, user.id);
            println!("API token: {}", user.api_token);
        }
    }
    Ok(())
}
