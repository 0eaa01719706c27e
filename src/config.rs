//! Typed configuration: environment variables plus the queue limits file.
//!
//! Environment config loads once at startup and fails fast on missing
//! required vars. Sensitive values are wrapped in secrecy::SecretString to
//! prevent log leaks.

use std::collections::HashMap;
use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_WORKERS: u32 = 16;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Per-queue slot budgets, loaded from TOML:
///
/// ```toml
/// default_max_workers = 16
///
/// [queues.email]
/// max_workers = 2
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct QueueLimits {
    #[serde(default = "default_max_workers")]
    pub default_max_workers: u32,
    #[serde(default)]
    pub queues: HashMap<String, QueueLimitEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueLimitEntry {
    pub max_workers: u32,
}

fn default_max_workers() -> u32 {
    DEFAULT_MAX_WORKERS
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            default_max_workers: DEFAULT_MAX_WORKERS,
            queues: HashMap::new(),
        }
    }
}

impl QueueLimits {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read queue limits {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad queue limits: {e}")))
    }

    /// Slot budget for a queue: its own entry when present, else the
    /// default.
    pub fn max_workers(&self, queue: &str) -> u32 {
        self.queues
            .get(queue)
            .map(|entry| entry.max_workers)
            .unwrap_or(self.default_max_workers)
    }
}
