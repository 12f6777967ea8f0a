//! Raw activity samples.
//!
//! One row per capture tick, except while the foreground process is a
//! coalescing marker (lock screen / idle), where the latest row is refreshed
//! in place instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the capture interface hands over on each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureReading {
    #[serde(default)]
    pub window_title: String,
    pub process_name: String,
    #[serde(default)]
    pub process_path: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub browser_url: Option<String>,
    #[serde(default)]
    pub browser_tab_title: Option<String>,
    #[serde(default)]
    pub cpu_usage_percent: Option<f64>,
    #[serde(default)]
    pub memory_usage_percent: Option<f64>,
    #[serde(default)]
    pub mouse_movements: u64,
    #[serde(default)]
    pub input_events: Option<u64>,
    #[serde(default = "default_user_active")]
    pub is_user_active: bool,
}

fn default_user_active() -> bool {
    true
}

/// A persisted sample. Timestamps are `None` when the stored text could not
/// be parsed; such rows are still returned so callers can decide what to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySample {
    pub id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub window_title: String,
    pub process_name: String,
    pub process_path: String,
    pub platform: String,
    pub browser_url: Option<String>,
    pub browser_tab_title: Option<String>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub mouse_movements: u64,
    pub input_events: Option<u64>,
    pub is_user_active: bool,
    pub synced: bool,
}

impl ActivitySample {
    /// End of the interval this sample covers: `updated_at` when present,
    /// otherwise `created_at`.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        match (self.updated_at, self.created_at) {
            (Some(updated), Some(created)) => Some(updated.max(created)),
            (updated, created) => updated.or(created),
        }
    }
}

/// Result of recording a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(i64),
    Coalesced(i64),
}

impl RecordOutcome {
    pub fn id(&self) -> i64 {
        match self {
            RecordOutcome::Inserted(id) | RecordOutcome::Coalesced(id) => *id,
        }
    }
}

/// Processes whose consecutive samples collapse into a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescePolicy {
    markers: Vec<String>,
}

impl CoalescePolicy {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            markers: Vec::new(),
        }
    }

    pub fn is_marker(&self, process_name: &str) -> bool {
        self.markers.iter().any(|marker| marker == process_name)
    }
}

impl Default for CoalescePolicy {
    fn default() -> Self {
        Self::new(["loginwindow"])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total_records: u64,
    pub unsynced_records: u64,
}
