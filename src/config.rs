//! Worker launch and timeout configuration.
//!
//! Settings come from an optional JSON file, then environment overrides:
//!
//! 1. An explicit path passed to [`WorkerConfig::load`]
//! 2. `$MEMORIA_CONFIG`
//! 3. `<config dir>/memoria/config.json` (XDG on Linux, Library on macOS)
//! 4. Built-in defaults
//!
//! `MEMORIA_WORKER_CMD` replaces the worker command line and
//! `MEMORIA_TIMEOUT_MS` the default request timeout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default worker program.
pub const DEFAULT_WORKER_COMMAND: &str = "memoria-worker";

/// Protocol version announced in the `initialize` handshake.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 500;

/// How to launch and talk to the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program to launch.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory for the worker, if not inherited.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the worker.
    pub env: HashMap<String, String>,
    /// Default deadline for a single request.
    pub request_timeout_ms: u64,
    /// Deadline for the `initialize` handshake.
    pub handshake_timeout_ms: u64,
    /// How long to wait for a clean exit after closing stdin.
    pub shutdown_grace_ms: u64,
    /// Client identity sent in the handshake.
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_WORKER_COMMAND.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Build a config from a single command line such as
    /// `python -m memoria.worker --stdio`.
    ///
    /// The line is split on whitespace; quoting is not interpreted.
    ///
    /// # Errors
    ///
    /// Returns an error if the line contains no program.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut config = Self::default();
        config.set_command_line(line)?;
        Ok(config)
    }

    /// Replace `command` and `args` from a whitespace-separated line.
    pub fn set_command_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let Some(command) = parts.next() else {
            bail!("Worker command line is empty");
        };
        self.command = command;
        self.args = parts.collect();
        Ok(())
    }

    /// Load from file (if any) and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or
    /// parsed, or if an environment override is malformed.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit_path) {
            Some(path) => {
                tracing::info!("Loading worker config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn resolve_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit_path {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = std::env::var("MEMORIA_CONFIG") {
            return Some(PathBuf::from(path));
        }

        default_config_path().filter(|p| p.exists())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(line) = std::env::var("MEMORIA_WORKER_CMD") {
            self.set_command_line(&line)
                .context("Invalid MEMORIA_WORKER_CMD")?;
        }

        if let Ok(value) = std::env::var("MEMORIA_TIMEOUT_MS") {
            self.request_timeout_ms = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid MEMORIA_TIMEOUT_MS value: {}", value))?;
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// `<config dir>/memoria/config.json`, when a config dir is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("memoria").join("config.json"))
}
