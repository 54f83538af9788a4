//! Layered configuration: built-in defaults < JSON config file < CLI flags.

use crate::api::ClientSettings;
use crate::model::ControllerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Keeps a misconfigured interval from turning polling into a busy loop.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub cookie: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub starting_phase: Option<Duration>,
}

/// Values given on the command line (or via env vars).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub cookie: Option<String>,
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub starting_phase: Option<Duration>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub client: ClientSettings,
    pub controller: ControllerConfig,
}

/// `<config_dir>/scholar-runs/config.json`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("scholar-runs").join("config.json"))
}

pub(crate) fn resolve(overrides: &ConfigOverrides) -> Result<Settings> {
    let file = match overrides.config_path.as_deref() {
        Some(path) => load_file(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => load_file(&path)?,
            _ => FileConfig::default(),
        },
    };
    Ok(merge(overrides, file))
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    debug!(path = %path.display(), "loaded config file");
    Ok(cfg)
}

fn merge(overrides: &ConfigOverrides, file: FileConfig) -> Settings {
    let defaults = ControllerConfig::default();
    let mut poll_interval = overrides
        .poll_interval
        .or(file.poll_interval)
        .unwrap_or(defaults.poll_interval);
    if poll_interval < MIN_POLL_INTERVAL {
        warn!(
            requested = ?poll_interval,
            minimum = ?MIN_POLL_INTERVAL,
            "poll interval too small; using minimum"
        );
        poll_interval = MIN_POLL_INTERVAL;
    }

    Settings {
        client: ClientSettings {
            base_url: overrides
                .base_url
                .clone()
                .or(file.base_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            cookie: overrides.cookie.clone().or(file.cookie),
            timeout: overrides.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT),
            user_agent: format!("scholar-runs/{}", env!("CARGO_PKG_VERSION")),
        },
        controller: ControllerConfig {
            poll_interval,
            starting_phase: overrides
                .starting_phase
                .or(file.starting_phase)
                .unwrap_or(defaults.starting_phase),
        },
    }
}
