use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::aggregation::config::AggregationConfig;
use crate::db::models::ActivitySample;
use crate::models::{ActivitySession, GroupingKey};

/// Sessions produced by one aggregation pass plus every sample id they cover.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub sessions: Vec<ActivitySession>,
    pub covered_ids: BTreeSet<i64>,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn grouping_key(sample: &ActivitySample) -> GroupingKey {
    GroupingKey {
        process_name: sample.process_name.clone(),
        window_title: sample.window_title.clone(),
        browser_url: sample.browser_url.clone().unwrap_or_default(),
        platform: sample.platform.clone(),
        process_path: sample.process_path.clone(),
    }
}

/// Running totals for the session currently being built.
struct SessionBuilder {
    key: GroupingKey,
    browser_tab_title: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cpu_sum: f64,
    cpu_count: u32,
    memory_sum: f64,
    memory_count: u32,
    mouse_movements: u64,
    input_events: u64,
    is_user_active: bool,
    source_ids: Vec<i64>,
}

impl SessionBuilder {
    fn open(key: GroupingKey, sample: &ActivitySample, at: DateTime<Utc>) -> Self {
        let builder = Self {
            key,
            browser_tab_title: sample.browser_tab_title.clone().unwrap_or_default(),
            start: at,
            end: at,
            cpu_sum: 0.0,
            cpu_count: 0,
            memory_sum: 0.0,
            memory_count: 0,
            mouse_movements: 0,
            input_events: 0,
            is_user_active: false,
            source_ids: Vec::new(),
        };
        builder.absorb(sample, at)
    }

    /// A sample continues the session when it has the same key and starts no
    /// earlier than the session's end and at most `max_gap` after it.
    fn accepts(&self, key: &GroupingKey, at: DateTime<Utc>, max_gap: Duration) -> bool {
        let gap = at - self.end;
        self.key == *key && gap >= Duration::zero() && gap <= max_gap
    }

    fn absorb(mut self, sample: &ActivitySample, at: DateTime<Utc>) -> Self {
        let sample_end = sample.last_seen().map_or(at, |seen| seen.max(at));
        self.end = self.end.max(sample_end);

        if let Some(cpu) = sample.cpu_usage {
            self.cpu_sum += cpu;
            self.cpu_count += 1;
        }
        if let Some(memory) = sample.memory_usage {
            self.memory_sum += memory;
            self.memory_count += 1;
        }

        self.mouse_movements += sample.mouse_movements;
        self.input_events += sample.input_events.unwrap_or(sample.mouse_movements);
        self.is_user_active |= sample.is_user_active;
        self.source_ids.push(sample.id);
        self
    }

    fn finish(self) -> ActivitySession {
        let elapsed_ms = (self.end - self.start).num_milliseconds();
        let duration_secs = ((elapsed_ms as f64 / 1000.0).round() as i64).max(1);

        ActivitySession {
            start_time: self.start,
            end_time: self.end,
            duration_secs,
            window_title: self.key.window_title,
            process_name: self.key.process_name,
            process_path: self.key.process_path,
            platform: self.key.platform,
            browser_url: self.key.browser_url,
            browser_tab_title: self.browser_tab_title,
            cpu_usage_avg: average(self.cpu_sum, self.cpu_count),
            memory_usage_avg: average(self.memory_sum, self.memory_count),
            mouse_movements_total: self.mouse_movements,
            input_events_total: self.input_events,
            is_user_active: self.is_user_active,
            source_ids: self.source_ids,
        }
    }
}

fn average(sum: f64, count: u32) -> Option<f64> {
    (count > 0).then(|| sum / f64::from(count))
}

/// Groups raw samples into sessions.
///
/// Samples are ordered by creation time (stable, so equal timestamps keep
/// their input order). Samples without a usable creation time are left out
/// of every output, including `covered_ids`.
pub fn aggregate_sessions(samples: &[ActivitySample], config: &AggregationConfig) -> Aggregation {
    let mut timed: Vec<(DateTime<Utc>, &ActivitySample)> = samples
        .iter()
        .filter_map(|sample| sample.created_at.map(|at| (at, sample)))
        .collect();

    let skipped = samples.len() - timed.len();
    if skipped > 0 {
        debug!("Skipping {skipped} samples without a usable timestamp");
    }

    timed.sort_by_key(|(at, _)| *at);

    // Anything past a few thousand years is "unbounded"; keeps chrono in range.
    let max_gap_secs = i64::try_from(config.max_gap_secs)
        .unwrap_or(i64::MAX)
        .min(100_000_000_000);
    let max_gap = Duration::seconds(max_gap_secs);

    let (mut sessions, open) = timed.into_iter().fold(
        (Vec::new(), None::<SessionBuilder>),
        |(mut finished, open), (at, sample)| {
            let key = grouping_key(sample);
            let next = match open {
                Some(builder) if builder.accepts(&key, at, max_gap) => builder.absorb(sample, at),
                Some(builder) => {
                    finished.push(builder.finish());
                    SessionBuilder::open(key, sample, at)
                }
                None => SessionBuilder::open(key, sample, at),
            };
            (finished, Some(next))
        },
    );

    if let Some(builder) = open {
        sessions.push(builder.finish());
    }

    let covered_ids = sessions
        .iter()
        .flat_map(|session| session.source_ids.iter().copied())
        .collect();

    Aggregation {
        sessions,
        covered_ids,
    }
}
