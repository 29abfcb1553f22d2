//! Daemon configuration: built-in defaults, then `<data_dir>/config.yaml`
//! if present, then `USAGE_MONITOR_*` environment variables.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapters::deepl::{DEFAULT_FREE_BASE_URL, DEFAULT_PRO_BASE_URL};
use crate::poller::DEFAULT_MAX_WORKERS;
use crate::store::MAX_QUERY_INTERVAL_SECS;

const ENV_PREFIX: &str = "USAGE_MONITOR_";
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub free_base_url: String,
    pub pro_base_url: String,
    pub request_timeout_secs: u64,
    pub default_interval_secs: i64,
    pub max_concurrent_groups: usize,
    pub probe_pause_ms: u64,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().unwrap_or_else(|| PathBuf::from(".usage-monitor")),
            free_base_url: DEFAULT_FREE_BASE_URL.to_string(),
            pro_base_url: DEFAULT_PRO_BASE_URL.to_string(),
            request_timeout_secs: 30,
            default_interval_secs: 3600,
            max_concurrent_groups: DEFAULT_MAX_WORKERS,
            probe_pause_ms: 500,
            log_json: false,
        }
    }
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".usage-monitor"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve with `lookup` standing in for the process environment.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty());

        let data_dir = match var("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?,
        };

        let file = data_dir.join(CONFIG_FILE);
        let mut config = if file.exists() {
            Self::from_file(&file)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir;

        if let Some(url) = var("FREE_BASE_URL") {
            config.free_base_url = url;
        }
        if let Some(url) = var("PRO_BASE_URL") {
            config.pro_base_url = url;
        }
        if let Some(v) = var("REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_env("REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("DEFAULT_INTERVAL_SECS") {
            config.default_interval_secs = parse_env("DEFAULT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("MAX_CONCURRENT_GROUPS") {
            config.max_concurrent_groups = parse_env("MAX_CONCURRENT_GROUPS", &v)?;
        }
        if let Some(v) = var("PROBE_PAUSE_MS") {
            config.probe_pause_ms = parse_env("PROBE_PAUSE_MS", &v)?;
        }
        if let Some(v) = var("LOG_JSON") {
            config.log_json = matches!(v.trim(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }
        if self.default_interval_secs <= 0 || self.default_interval_secs > MAX_QUERY_INTERVAL_SECS {
            bail!("default_interval_secs must be between 1 and {}", MAX_QUERY_INTERVAL_SECS);
        }
        if self.max_concurrent_groups == 0 {
            bail!("max_concurrent_groups must be greater than 0");
        }
        if self.free_base_url.is_empty() || self.pro_base_url.is_empty() {
            bail!("API base URLs cannot be empty");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("usage_monitor.db")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("usage_monitor.sock")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_pause(&self) -> Duration {
        Duration::from_millis(self.probe_pause_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("{}{}={:?} is invalid: {}", ENV_PREFIX, name, value, e))
}
