use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::aggregation::AggregationConfig;
use crate::db::CoalescePolicy;
use crate::sensing::CaptureSettings;
use crate::sync::SyncConfig;

const SETTINGS_FILE: &str = "settings.json";

/// Agent configuration. Read from `settings.json`, then overridden by
/// environment variables (a `.env` file in the working directory counts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub database_path: Option<PathBuf>,
    pub auth_path: Option<PathBuf>,
    /// Program and arguments of the helper that reports the foreground window.
    pub capture_command: Vec<String>,
    pub capture_interval_secs: u64,
    pub capture_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub sync_warmup_secs: u64,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub max_gap_secs: u64,
    pub coalescing_markers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_endpoint: None,
            api_key: None,
            database_path: None,
            auth_path: None,
            capture_command: Vec::new(),
            capture_interval_secs: 5,
            capture_timeout_secs: 10,
            sync_interval_secs: 30 * 60,
            sync_warmup_secs: 5,
            batch_size: 100,
            inter_batch_delay_ms: 1_000,
            request_timeout_secs: 30,
            max_gap_secs: 15,
            coalescing_markers: vec!["loginwindow".into()],
        }
    }
}

impl Settings {
    /// Loads settings from `path` (or the default location) and applies
    /// environment overrides. A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let path = path.map(Path::to_path_buf).unwrap_or_else(default_settings_path);
        let mut settings = Self::from_file(&path)?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(endpoint) = lookup("API_ENDPOINT") {
            self.api_endpoint = Some(endpoint);
        }
        if let Some(key) = lookup("API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(path) = lookup("PULSETRACK_DB") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(command) = lookup("PULSETRACK_CAPTURE_COMMAND") {
            self.capture_command = parse_command(&command);
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| data_dir().join("activity.sqlite3"))
    }

    pub fn auth_path(&self) -> PathBuf {
        self.auth_path
            .clone()
            .unwrap_or_else(crate::credentials::default_auth_path)
    }

    pub fn api_endpoint(&self) -> Option<&str> {
        self.api_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            interval: Duration::from_secs(self.capture_interval_secs.max(1)),
            timeout: Duration::from_secs(self.capture_timeout_secs.max(1)),
            policy: CoalescePolicy::new(self.coalescing_markers.iter().cloned()),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.batch_size.max(1),
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
            aggregation: AggregationConfig {
                max_gap_secs: self.max_gap_secs,
            },
        }
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn sync_warmup(&self) -> Duration {
        Duration::from_secs(self.sync_warmup_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Parses a capture command from the environment. A JSON array of strings
/// is taken as the exact argv, so arguments may contain spaces; anything else
/// is split on whitespace, without shell quoting.
fn parse_command(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        match serde_json::from_str::<Vec<String>>(trimmed) {
            Ok(argv) => return argv,
            Err(err) => warn!(
                "PULSETRACK_CAPTURE_COMMAND is not a JSON string array ({err}), splitting on whitespace"
            ),
        }
    }
    trimmed.split_whitespace().map(str::to_string).collect()
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pulsetrack")
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join(SETTINGS_FILE)
}
