//! Connection defaults for the REPL client.
//!
//! Resolution order (later wins):
//! 1. Built-in defaults (`127.0.0.1:9192`, 5s connect timeout)
//! 2. JSON config file: `$CHLORINE_CONFIG`, else
//!    `<config dir>/chlorine/config.json` (`~/.config` on Linux,
//!    `~/Library/Application Support` on macOS)
//! 3. Environment: `CHLORINE_HOST`, `CHLORINE_PORT`, `CHLORINE_NS`,
//!    `CHLORINE_CONNECT_TIMEOUT_MS`
//!
//! The CLI additionally honours a `.nrepl-port` file written by the server
//! next to the project (see [`discover_port_file`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port used by the bundled example server (`NREPL::Server.start(port: 9192)`).
pub const DEFAULT_PORT: u16 = 9192;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// File nREPL servers drop in the project root with their listening port.
pub const PORT_FILE: &str = ".nrepl-port";

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Namespace used when an evaluation does not name one.
    pub default_ns: Option<String>,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            default_ns: None,
        }
    }
}

impl ReplConfig {
    /// Load from the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Using config from {}", path.display());
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `CHLORINE_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CHLORINE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("CHLORINE_PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid CHLORINE_PORT value: {}", port))?;
        }
        if let Some(ns) = lookup("CHLORINE_NS") {
            self.default_ns = Some(ns).filter(|ns| !ns.is_empty());
        }
        if let Some(ms) = lookup("CHLORINE_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("Invalid CHLORINE_CONNECT_TIMEOUT_MS value: {}", ms))?;
        }
        Ok(())
    }

    /// Point the config at an endpoint string (see [`parse_endpoint`]).
    pub fn set_endpoint(&mut self, endpoint: &str) -> Result<()> {
        let (host, port) = parse_endpoint(endpoint)?;
        self.host = host;
        self.port = port;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `nrepl://host:port` form of the configured endpoint.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("nrepl://[{}]:{}", self.host, self.port)
        } else {
            format!("nrepl://{}:{}", self.host, self.port)
        }
    }
}

/// Location of the config file, if one can be determined.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHLORINE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("chlorine").join("config.json"))
}

/// Parse `nrepl://host:port`, `tcp://host:port` or bare `host:port`.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("nrepl://{}", endpoint)
    };

    let url = Url::parse(&with_scheme)
        .with_context(|| format!("Invalid endpoint: {}", endpoint))?;
    if !matches!(url.scheme(), "nrepl" | "tcp") {
        bail!("Unsupported endpoint scheme {:?} (expected nrepl:// or tcp://)", url.scheme());
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("Endpoint {} has no host", endpoint))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| anyhow!("Endpoint {} has no port", endpoint))?;

    Ok((host, port))
}

/// Find a `.nrepl-port` file in `start` or any parent directory.
pub fn discover_port_file(start: &Path) -> Option<u16> {
    for dir in start.ancestors() {
        let candidate = dir.join(PORT_FILE);
        let Ok(text) = std::fs::read_to_string(&candidate) else {
            continue;
        };
        match text.trim().parse() {
            Ok(port) => {
                tracing::info!("Using port {} from {}", port, candidate.display());
                return Some(port);
            }
            Err(_) => {
                tracing::warn!("Ignoring malformed {}", candidate.display());
            }
        }
    }
    None
}
