use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cs-workers")]
#[command(version, about = "Compute Studio workers: jobs, app deployments and image builds")]
pub struct Cli {
    /// Path to the TOML config file. Missing file means defaults.
    #[arg(short, long, global = true, default_value = "workers.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to listen on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path (overrides [database].path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create the database schema and exit
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Manage registered upstream webapps
    Users {
        #[command(subcommand)]
        command: UsersCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum UsersCommands {
    /// Register a webapp and print the API token it should use
    Add {
        username: String,
        /// Base URL of the webapp; results are relayed here
        #[arg(long)]
        url: String,
        #[arg(long, env = "CS_CLIENT_ID")]
        client_id: String,
        #[arg(long, env = "CS_CLIENT_SECRET")]
        client_secret: String,
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cs_workers=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cmd::load_config(&cli.config)?;

    match &cli.command {
        Commands::Serve { port, db_path } => {
            cmd::cmd_serve(config, *port, db_path.clone()).await?;
        }
        Commands::InitDb { db_path } => cmd::cmd_init_db(&config, db_path.clone())?,
        Commands::Users { command } => cmd::cmd_users(&config, command.clone())?,
    }

    Ok(())
}
