//! CLI entry point for calbridge.
//!
//! This binary provides the `calbridge` command: `serve` runs the OAuth
//! broker and MCP endpoint over HTTP, `sweep` garbage collects expired
//! broker state once.

mod cli;
mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use calbridge_broker::{
    Broker, GoogleConfig, GoogleCredentials, GoogleProvider, TokenIssuer,
};
use calbridge_store::{AuthSessionStore, Database, LoginStateStore, TokenStore};
use calbridge_web::{WebServer, Whoami};

use crate::cli::{Cli, Commands, LogFormat, ServeArgs};
use crate::config::FileConfig;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` must be loaded before clap reads `CALBRIDGE_*` variables.
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing("info", cli.log_format);
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let db_path = file.db_path(cli.db.as_deref())?;

    match cli.command {
        Commands::Serve(args) => cmd_serve(&file, &db_path, &args).await,
        Commands::Sweep => cmd_sweep(&file, &db_path).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(file: &FileConfig, db_path: &Path, args: &ServeArgs) -> Result<()> {
    let web_config = file.web_config(args)?;
    let broker_config = file.broker_config();

    let credentials_path = file.credentials_path(args.credentials.as_deref())?;
    let credentials = GoogleCredentials::from_file(&credentials_path).with_context(|| {
        format!(
            "failed to load Google credentials from {}",
            credentials_path.display()
        )
    })?;
    let redirect_uri = web_config.endpoint("/auth/callback");
    info!(%redirect_uri, "upstream redirect URI (must be registered with Google)");
    let mut google = GoogleConfig::new(credentials, redirect_uri);
    google.timeout = file.upstream_timeout();
    let upstream =
        GoogleProvider::new(google).context("failed to build the upstream HTTP client")?;

    let db = open_database(db_path).await?;
    let broker = Broker::new(db, Arc::new(upstream), broker_config);

    WebServer::new(web_config, broker, Arc::new(Whoami))
        .start()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("web server failed")
}

// ---------------------------------------------------------------------------
// Subcommand: sweep
// ---------------------------------------------------------------------------

async fn cmd_sweep(file: &FileConfig, db_path: &Path) -> Result<()> {
    let db = open_database(db_path).await?;
    let issuer = TokenIssuer::new(
        TokenStore::new(db.clone()),
        AuthSessionStore::new(db.clone()),
        LoginStateStore::new(db),
        file.broker_config(),
    );
    let report = issuer.sweep().await.context("sweep failed")?;
    info!(
        sessions = report.sessions,
        login_states = report.login_states,
        token_pairs = report.token_pairs,
        "sweep complete"
    );
    println!("removed {} expired records", report.total());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_database(db_path: &Path) -> Result<Database> {
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    }
    let db = Database::open_and_migrate(db_path.to_path_buf())
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    info!(path = %db_path.display(), "store initialized");
    Ok(db)
}

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Pretty => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
