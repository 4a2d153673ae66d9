//! Configuration layering for the `calbridge` binary.
//!
//! Precedence, lowest first: built-in defaults, the optional TOML file,
//! then environment and flags (clap merges those two).
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0"
//! port = 8080
//! base_url = "https://cal.example.com"
//!
//! [storage]
//! db = "/var/lib/calbridge/calbridge.db"
//!
//! [google]
//! credentials = "/etc/calbridge/credentials.json"
//! timeout_secs = 30
//!
//! [broker]
//! session_ttl_secs = 600
//! access_token_ttl_secs = 3600
//! refresh_grace_secs = 604800
//! sweep_interval_secs = 600
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use calbridge_broker::BrokerConfig;
use calbridge_broker::upstream::DEFAULT_UPSTREAM_TIMEOUT;
use calbridge_web::WebConfig;
use serde::Deserialize;
use url::Url;

use crate::cli::ServeArgs;

/// The TOML file, every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub google: GoogleSection,
    pub broker: BrokerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub db: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GoogleSection {
    pub credentials: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    pub session_ttl_secs: Option<u64>,
    pub access_token_ttl_secs: Option<u64>,
    pub refresh_grace_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn broker_config(&self) -> BrokerConfig {
        let defaults = BrokerConfig::default();
        let section = &self.broker;
        BrokerConfig {
            session_ttl: section
                .session_ttl_secs
                .map_or(defaults.session_ttl, Duration::from_secs),
            access_token_ttl: section
                .access_token_ttl_secs
                .map_or(defaults.access_token_ttl, Duration::from_secs),
            refresh_grace: section
                .refresh_grace_secs
                .map_or(defaults.refresh_grace, Duration::from_secs),
            sweep_interval: section
                .sweep_interval_secs
                .map(|secs| secs.max(1))
                .map_or(defaults.sweep_interval, Duration::from_secs),
            upstream_refresh_margin: defaults.upstream_refresh_margin,
        }
    }

    /// Database path: flag or env, then file, then the default location.
    pub fn db_path(&self, flag: Option<&Path>) -> Result<PathBuf> {
        match flag.or(self.storage.db.as_deref()) {
            Some(path) => Ok(path.to_path_buf()),
            None => Ok(default_config_dir()?.join("calbridge.db")),
        }
    }

    /// Credentials path: flag or env, then file, then the default location.
    pub fn credentials_path(&self, flag: Option<&Path>) -> Result<PathBuf> {
        match flag.or(self.google.credentials.as_deref()) {
            Some(path) => Ok(path.to_path_buf()),
            None => Ok(default_config_dir()?.join("credentials.json")),
        }
    }

    /// Per-request timeout for calls to Google.
    pub fn upstream_timeout(&self) -> Duration {
        self.google
            .timeout_secs
            .map(|secs| secs.max(1))
            .map_or(DEFAULT_UPSTREAM_TIMEOUT, Duration::from_secs)
    }

    /// Web settings with flags and env layered over the file.
    pub fn web_config(&self, args: &ServeArgs) -> Result<WebConfig> {
        let defaults = WebConfig::default();
        let bind_addr = args
            .addr
            .clone()
            .or_else(|| self.server.addr.clone())
            .unwrap_or(defaults.bind_addr);
        let port = args.port.or(self.server.port).unwrap_or(defaults.port);
        let explicit = args.base_url.as_deref().or(self.server.base_url.as_deref());
        let base_url = resolve_base_url(explicit, &bind_addr, port)?;
        Ok(WebConfig {
            bind_addr,
            port,
            base_url,
        })
    }
}

/// The public base URL, without a trailing slash.
///
/// An explicit value must be an absolute http(s) URL with a host and no
/// query or fragment. Otherwise the URL is derived from the bind address,
/// with wildcard addresses advertised as `localhost`.
pub fn resolve_base_url(explicit: Option<&str>, bind_addr: &str, port: u16) -> Result<String> {
    if let Some(raw) = explicit {
        let url = Url::parse(raw).with_context(|| format!("invalid base URL {raw:?}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("base URL must use http or https: {raw}");
        }
        if url.host_str().is_none_or(str::is_empty) {
            bail!("base URL must include a host: {raw}");
        }
        if url.query().is_some() || url.fragment().is_some() {
            bail!("base URL must not carry a query or fragment: {raw}");
        }
        return Ok(raw.trim_end_matches('/').to_string());
    }

    let host = match bind_addr {
        "" | "0.0.0.0" | "::" | "[::]" => "localhost".to_string(),
        addr if addr.contains(':') && !addr.starts_with('[') => format!("[{addr}]"),
        addr => addr.to_string(),
    };
    Ok(format!("http://{host}:{port}"))
}

/// `$XDG_CONFIG_HOME/calbridge`, else `~/.config/calbridge`, else the
/// platform config directory.
pub fn default_config_dir() -> Result<PathBuf> {
    config_dir_from(
        std::env::var_os("XDG_CONFIG_HOME"),
        dirs::home_dir(),
        dirs::config_dir(),
    )
    .context("cannot locate a config directory: set XDG_CONFIG_HOME")
}

fn config_dir_from(
    xdg: Option<OsString>,
    home: Option<PathBuf>,
    platform: Option<PathBuf>,
) -> Option<PathBuf> {
    xdg.filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            home.filter(|h| !h.as_os_str().is_empty())
                .map(|h| h.join(".config"))
        })
        .or(platform)
        .map(|base| base.join("calbridge"))
}
