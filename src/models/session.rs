use chrono::{DateTime, Utc};

/// Identifies one activity context. Samples only merge into a session when
/// all five parts match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupingKey {
    pub process_name: String,
    pub window_title: String,
    pub browser_url: String,
    pub platform: String,
    pub process_path: String,
}

/// A contiguous run of samples sharing a grouping key. Derived on every
/// aggregation pass and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySession {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: i64,
    pub window_title: String,
    pub process_name: String,
    pub process_path: String,
    pub platform: String,
    pub browser_url: String,
    pub browser_tab_title: String,
    pub cpu_usage_avg: Option<f64>,
    pub memory_usage_avg: Option<f64>,
    pub mouse_movements_total: u64,
    pub input_events_total: u64,
    pub is_user_active: bool,
    pub source_ids: Vec<i64>,
}

impl ActivitySession {
    pub fn sample_count(&self) -> usize {
        self.source_ids.len()
    }

    pub fn key(&self) -> GroupingKey {
        GroupingKey {
            process_name: self.process_name.clone(),
            window_title: self.window_title.clone(),
            browser_url: self.browser_url.clone(),
            platform: self.platform.clone(),
            process_path: self.process_path.clone(),
        }
    }
}
