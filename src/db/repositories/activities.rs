use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{params, OptionalExtension, Row, Rows};

use crate::db::{
    connection::Database,
    helpers::{parse_stored_datetime, to_i64, to_u64},
    models::{ActivitySample, ActivityStats, CaptureReading, CoalescePolicy, RecordOutcome},
};

const SAMPLE_COLUMNS: &str = "id, created_at, updated_at, window_title, process_name, process_path,
     platform, browser_url, browser_tab_title, cpu_usage, memory_usage, mouse_movements,
     input_events, is_user_active, synced";

fn row_to_sample(row: &Row) -> Result<ActivitySample> {
    let created_at: Option<String> = row.get("created_at")?;
    let updated_at: Option<String> = row.get("updated_at")?;
    let mouse_movements: i64 = row.get("mouse_movements")?;
    let input_events: Option<i64> = row.get("input_events")?;

    Ok(ActivitySample {
        id: row.get("id")?,
        created_at: parse_stored_datetime(created_at.as_deref()),
        updated_at: parse_stored_datetime(updated_at.as_deref()),
        window_title: row.get("window_title")?,
        process_name: row.get("process_name")?,
        process_path: row.get("process_path")?,
        platform: row.get("platform")?,
        browser_url: row.get("browser_url")?,
        browser_tab_title: row.get("browser_tab_title")?,
        cpu_usage: row.get("cpu_usage")?,
        memory_usage: row.get("memory_usage")?,
        mouse_movements: to_u64(mouse_movements, "mouse_movements")?,
        input_events: input_events
            .map(|count| to_u64(count, "input_events"))
            .transpose()?,
        is_user_active: row.get("is_user_active")?,
        synced: row.get("synced")?,
    })
}

/// Decodes every row that can be decoded. A row with out-of-range or
/// mistyped values is skipped and stays in the log untouched, so one bad
/// row cannot block the rest from syncing.
fn collect_samples(mut rows: Rows<'_>) -> Result<Vec<ActivitySample>> {
    let mut samples = Vec::new();
    while let Some(row) = rows.next()? {
        match row_to_sample(row) {
            Ok(sample) => samples.push(sample),
            Err(err) => {
                let id: Option<i64> = row.get("id").ok();
                warn!("Skipping undecodable activity row {id:?}: {err:#}");
            }
        }
    }
    Ok(samples)
}

impl Database {
    /// Stores a capture reading taken at `at`.
    ///
    /// If the reading's process is a coalescing marker and the latest row is
    /// an unsynced row for the same process, that row is refreshed in place.
    /// Everything else is appended with a fresh id.
    ///
    /// A marker row that was already delivered is never refreshed: the
    /// collector has its old end time, so idle time folded into it would be
    /// lost. A new row is started instead.
    pub async fn record_activity(
        &self,
        reading: &CaptureReading,
        at: DateTime<Utc>,
        policy: &CoalescePolicy,
    ) -> Result<RecordOutcome> {
        let reading = reading.clone();
        let coalesce = policy.is_marker(&reading.process_name);
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let timestamp = at.to_rfc3339();
            let input_events = reading.input_events.map(to_i64).transpose()?;

            if coalesce {
                let previous: Option<(i64, String, bool)> = tx
                    .query_row(
                        "SELECT id, process_name, synced FROM activities ORDER BY id DESC LIMIT 1",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;

                if let Some((id, process_name, synced)) = previous {
                    if process_name == reading.process_name && !synced {
                        tx.execute(
                            "UPDATE activities
                             SET updated_at = ?1,
                                 cpu_usage = ?2,
                                 memory_usage = ?3,
                                 input_events = ?4,
                                 is_user_active = ?5
                             WHERE id = ?6",
                            params![
                                timestamp,
                                reading.cpu_usage_percent,
                                reading.memory_usage_percent,
                                input_events,
                                reading.is_user_active,
                                id,
                            ],
                        )
                        .context("failed to coalesce activity row")?;
                        tx.commit()?;
                        return Ok(RecordOutcome::Coalesced(id));
                    }
                }
            }

            tx.execute(
                "INSERT INTO activities (
                    created_at,
                    updated_at,
                    window_title,
                    process_name,
                    process_path,
                    platform,
                    browser_url,
                    browser_tab_title,
                    cpu_usage,
                    memory_usage,
                    mouse_movements,
                    input_events,
                    is_user_active
                ) VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    timestamp,
                    reading.window_title,
                    reading.process_name,
                    reading.process_path,
                    reading.platform,
                    reading.browser_url,
                    reading.browser_tab_title,
                    reading.cpu_usage_percent,
                    reading.memory_usage_percent,
                    to_i64(reading.mouse_movements)?,
                    input_events,
                    reading.is_user_active,
                ],
            )
            .context("failed to insert activity row")?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(RecordOutcome::Inserted(id))
        })
        .await
    }

    /// All samples not yet delivered, oldest id first.
    pub async fn unsynced_activities(&self) -> Result<Vec<ActivitySample>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAMPLE_COLUMNS} FROM activities WHERE synced = 0 ORDER BY id ASC"
            ))?;
            let rows = stmt.query([])?;
            collect_samples(rows)
        })
        .await
    }

    /// Flags the given ids as delivered. Unknown or already-synced ids are
    /// ignored. Returns how many rows changed state.
    pub async fn mark_synced(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let ids = ids.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE activities SET synced = 1 WHERE id = ?1 AND synced = 0",
                )?;
                for id in &ids {
                    changed += stmt.execute(params![id])?;
                }
            }
            tx.commit().context("failed to commit synced flags")?;
            Ok(changed)
        })
        .await
    }

    pub async fn most_recent_activity(&self) -> Result<Option<ActivitySample>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAMPLE_COLUMNS} FROM activities ORDER BY id DESC LIMIT 1"
            ))?;
            let rows = stmt.query([])?;
            Ok(collect_samples(rows)?.into_iter().next())
        })
        .await
    }

    pub async fn activity_stats(&self) -> Result<ActivityStats> {
        self.execute(|conn| {
            let (total, unsynced): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0)
                 FROM activities",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            Ok(ActivityStats {
                total_records: to_u64(total, "total_records")?,
                unsynced_records: to_u64(unsynced, "unsynced_records")?,
            })
        })
        .await
    }
}
