use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use parley_relay::Relay;
use tracing::info;

mod auth;
mod config;
mod db;
mod server;
mod telemetry;

use auth::{JwtIdentityVerifier, LibSqlUserDirectory, TokenValidator};
use crate::config::{LogFormat, Overrides, ServerConfig};
use db::{Database, MigrationRunner};
use server::AppState;

/// Parley Server - WebSocket group chat relay
#[derive(Parser)]
#[command(name = "parley-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (e.g. 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// User database file (in-memory when unset)
    #[arg(short, long)]
    database: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn overrides(self) -> Overrides {
        Overrides {
            config_file: self.config,
            listen_addr: self.listen,
            database_path: self.database,
            log_format: self.log_format,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.overrides()).context("invalid configuration")?;

    telemetry::init(config.log_format).map_err(|e| anyhow!("failed to initialize telemetry: {}", e))?;

    info!("Parley Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let db = Database::open("users", config.database_path.as_deref()).await?;
    MigrationRunner::users().run(&db).await?;

    let validator = TokenValidator::new(config.jwt_secret.as_bytes(), &config.allowed_algorithms)?;
    let verifier = JwtIdentityVerifier::new(validator, LibSqlUserDirectory::new(db.clone()));
    let relay = Arc::new(Relay::new(Arc::new(verifier), config.relay_config()));

    let state = Arc::new(AppState::new(relay, db));
    server::start(&config, state).await?;

    info!("Parley Server stopped");
    Ok(())
}
