//! CLI argument definitions for calbridge.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands. Every flag can also come from a `CALBRIDGE_*`
//! environment variable (or a `.env` file).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// calbridge -- OAuth identity broker and MCP bridge for Google Calendar and Gmail.
#[derive(Debug, Parser)]
#[command(name = "calbridge", version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, short, global = true, env = "CALBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the SQLite database.
    #[arg(long, global = true, env = "CALBRIDGE_DB")]
    pub db: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, env = "CALBRIDGE_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server and the background sweeper.
    Serve(ServeArgs),

    /// Delete expired sessions, login states and token pairs once, then exit.
    Sweep,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "CALBRIDGE_ADDR")]
    pub addr: Option<String>,

    /// Port to listen on.
    #[arg(long, short, env = "CALBRIDGE_PORT")]
    pub port: Option<u16>,

    /// Public base URL advertised to OAuth clients, e.g. `https://cal.example.com`.
    /// Derived from the bind address when omitted.
    #[arg(long, env = "CALBRIDGE_BASE_URL")]
    pub base_url: Option<String>,

    /// Path to the Google OAuth client `credentials.json`.
    #[arg(long, env = "CALBRIDGE_CREDENTIALS")]
    pub credentials: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Compact human-readable lines.
    Pretty,
    /// One JSON object per line.
    Json,
}
