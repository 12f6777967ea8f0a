use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::AuthUser;
use crate::models::ActivitySession;

/// Body of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub activities: Vec<ActivitySummary>,
    pub metadata: SyncMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub timestamp: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub duration_seconds: i64,
    pub window_title: String,
    pub process_name: String,
    pub process_path: String,
    pub platform: String,
    pub browser_url: String,
    pub browser_tab_title: String,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub mouse_movements: u64,
    pub input_events: u64,
    pub is_user_active: bool,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub total_records: usize,
    pub total_sessions: usize,
    pub sync_timestamp: String,
    pub device_platform: String,
}

impl From<&ActivitySession> for ActivitySummary {
    fn from(session: &ActivitySession) -> Self {
        let start = iso8601(session.start_time);
        Self {
            timestamp: start.clone(),
            start_timestamp: start,
            end_timestamp: iso8601(session.end_time),
            duration_seconds: session.duration_secs,
            window_title: session.window_title.clone(),
            process_name: session.process_name.clone(),
            process_path: session.process_path.clone(),
            platform: session.platform.clone(),
            browser_url: session.browser_url.clone(),
            browser_tab_title: session.browser_tab_title.clone(),
            cpu_usage: session.cpu_usage_avg,
            memory_usage: session.memory_usage_avg,
            mouse_movements: session.mouse_movements_total,
            input_events: session.input_events_total,
            is_user_active: session.is_user_active,
            sample_count: session.sample_count(),
        }
    }
}

impl SyncPayload {
    /// `total_records` is the number of raw samples the batch covers.
    pub fn build(
        user: Option<&AuthUser>,
        sessions: &[ActivitySession],
        total_records: usize,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user.map(|user| user.id.clone()),
            activities: sessions.iter().map(ActivitySummary::from).collect(),
            metadata: SyncMetadata {
                total_records,
                total_sessions: sessions.len(),
                sync_timestamp: iso8601(sent_at),
                device_platform: device_platform().to_string(),
            },
        }
    }
}

pub fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Platform names the collector already knows from earlier agents.
pub fn device_platform() -> &'static str {
    platform_name(std::env::consts::OS)
}

fn platform_name(os: &'static str) -> &'static str {
    match os {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}
