use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;

use crate::aggregation::{aggregate_sessions, AggregationConfig};
use crate::credentials::{AuthUser, CredentialProvider};
use crate::db::Database;
use crate::models::ActivitySession;

use super::payload::SyncPayload;
use super::transport::SessionTransport;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Aggregating,
    Transmitting,
    Committing,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub aggregation: AggregationConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            inter_batch_delay: Duration::from_secs(1),
            aggregation: AggregationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was already running.
    Skipped,
    NothingToSync,
    /// Unsynced rows exist but none of them could be aggregated.
    NoSessions { raw_records: usize },
    Completed(CycleReport),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            Self::Skipped | Self::NothingToSync => true,
            Self::NoSessions { .. } => false,
            Self::Completed(report) => report.failures.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub raw_records: usize,
    pub total_sessions: usize,
    pub total_batches: usize,
    pub succeeded_batches: usize,
    pub synced_sessions: usize,
    pub synced_records: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Transmission,
    Commit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// 1-based position of the batch within its cycle.
    pub batch: usize,
    pub sessions: usize,
    pub records: usize,
    pub stage: FailureStage,
    pub error: String,
}

/// Clears the in-flight flag and resets the phase when a cycle ends,
/// whichever way it ends.
struct CycleGuard<'a> {
    in_flight: &'a AtomicBool,
    phase: &'a watch::Sender<SyncPhase>,
}

impl<'a> CycleGuard<'a> {
    fn acquire(in_flight: &'a AtomicBool, phase: &'a watch::Sender<SyncPhase>) -> Option<Self> {
        in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { in_flight, phase })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.phase.send_replace(SyncPhase::Idle);
        self.in_flight.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    db: Database,
    transport: Arc<dyn SessionTransport>,
    credentials: Arc<dyn CredentialProvider>,
    config: SyncConfig,
    in_flight: AtomicBool,
    cycles_run: AtomicU64,
    phase: watch::Sender<SyncPhase>,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        transport: Arc<dyn SessionTransport>,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            db,
            transport,
            credentials,
            config,
            in_flight: AtomicBool::new(false),
            cycles_run: AtomicU64::new(0),
            phase,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Cycles that actually ran, skipped triggers excluded.
    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Runs one fetch → aggregate → transmit → commit pass. Storage errors
    /// while fetching abort the cycle; batch failures are reported in the
    /// returned `CycleReport`.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(_guard) = CycleGuard::acquire(&self.in_flight, &self.phase) else {
            log_debug!("Sync already in progress, skipping trigger");
            return Ok(CycleOutcome::Skipped);
        };
        self.cycles_run.fetch_add(1, Ordering::Relaxed);

        self.phase.send_replace(SyncPhase::Fetching);
        let samples = self
            .db
            .unsynced_activities()
            .await
            .context("Failed to load unsynced activities")?;

        if samples.is_empty() {
            log_debug!("No unsynced activities");
            return Ok(CycleOutcome::NothingToSync);
        }

        self.phase.send_replace(SyncPhase::Aggregating);
        let aggregation = aggregate_sessions(&samples, &self.config.aggregation);
        if aggregation.is_empty() {
            log_warn!(
                "{} unsynced activities produced no sessions, leaving them unsynced",
                samples.len()
            );
            return Ok(CycleOutcome::NoSessions {
                raw_records: samples.len(),
            });
        }

        let batches: Vec<&[ActivitySession]> = aggregation
            .sessions
            .chunks(self.config.batch_size.max(1))
            .collect();

        log_info!(
            "Syncing {} sessions from {} raw records in {} batch(es)",
            aggregation.sessions.len(),
            samples.len(),
            batches.len()
        );

        let user = self.credentials.user();
        let headers = self.credentials.auth_headers();
        let mut report = CycleReport {
            raw_records: samples.len(),
            total_sessions: aggregation.sessions.len(),
            total_batches: batches.len(),
            ..CycleReport::default()
        };

        for (index, batch) in batches.iter().enumerate() {
            if index > 0 && !self.config.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }

            let ids: Vec<i64> = batch
                .iter()
                .flat_map(|session| session.source_ids.iter().copied())
                .collect();

            match self.sync_batch(batch, &ids, user.as_ref(), &headers).await {
                Ok(()) => {
                    report.succeeded_batches += 1;
                    report.synced_sessions += batch.len();
                    report.synced_records += ids.len();
                    log_info!(
                        "Batch {}/{}: collector accepted {} sessions ({} records)",
                        index + 1,
                        batches.len(),
                        batch.len(),
                        ids.len()
                    );
                }
                Err((stage, err)) => {
                    log_error!("Batch {}/{} failed: {err:#}", index + 1, batches.len());
                    report.failures.push(BatchFailure {
                        batch: index + 1,
                        sessions: batch.len(),
                        records: ids.len(),
                        stage,
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        Ok(CycleOutcome::Completed(report))
    }

    async fn sync_batch(
        &self,
        batch: &[ActivitySession],
        ids: &[i64],
        user: Option<&AuthUser>,
        headers: &[(String, String)],
    ) -> std::result::Result<(), (FailureStage, anyhow::Error)> {
        // Counts only the rows this batch covers, even for a single batch, so
        // the collector never sees records it will not receive.
        let payload = SyncPayload::build(user, batch, ids.len(), Utc::now());

        self.phase.send_replace(SyncPhase::Transmitting);
        self.transport
            .send(&payload, headers)
            .await
            .map_err(|err| (FailureStage::Transmission, err.into()))?;

        // Only a confirmed delivery is committed, so a crash here re-sends
        // the batch next cycle.
        self.phase.send_replace(SyncPhase::Committing);
        self.db
            .mark_synced(ids)
            .await
            .map(|_| ())
            .map_err(|err| (FailureStage::Commit, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Unauthenticated;
    use crate::db::{CaptureReading, CoalescePolicy};
    use crate::sync::error::TransmissionError;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeTransport {
        responses: Mutex<VecDeque<Result<(), TransmissionError>>>,
        sent: Mutex<Vec<(SyncPayload, Vec<(String, String)>)>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeTransport {
        fn with_responses(responses: Vec<Result<(), TransmissionError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<SyncPayload> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(payload, _)| payload.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SessionTransport for FakeTransport {
        async fn send(
            &self,
            payload: &SyncPayload,
            headers: &[(String, String)],
        ) -> Result<(), TransmissionError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.sent
                .lock()
                .unwrap()
                .push((payload.clone(), headers.to_vec()));
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    struct SignedIn;

    impl CredentialProvider for SignedIn {
        fn user(&self) -> Option<AuthUser> {
            Some(AuthUser {
                id: "user-7".into(),
                email: None,
                name: None,
            })
        }

        fn auth_headers(&self) -> Vec<(String, String)> {
            vec![("Cookie".into(), "better-auth.session_token=t".into())]
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn reading(process: &str) -> CaptureReading {
        CaptureReading {
            window_title: format!("{process} window"),
            process_name: process.into(),
            process_path: format!("/usr/bin/{process}"),
            platform: "linux".into(),
            browser_url: None,
            browser_tab_title: None,
            cpu_usage_percent: Some(2.0),
            memory_usage_percent: Some(40.0),
            mouse_movements: 1,
            input_events: Some(1),
            is_user_active: true,
        }
    }

    fn open() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("activity.sqlite3")).unwrap();
        (dir, db)
    }

    /// Each sample gets its own process name so every sample is one session.
    async fn seed_distinct(db: &Database, count: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        for i in 0..count {
            let outcome = db
                .record_activity(
                    &reading(&format!("app{i}")),
                    t0() + chrono::Duration::seconds(i as i64 * 5),
                    &CoalescePolicy::disabled(),
                )
                .await
                .unwrap();
            ids.push(outcome.id());
        }
        ids
    }

    fn engine(db: &Database, transport: Arc<FakeTransport>, batch_size: usize) -> SyncEngine {
        SyncEngine::new(
            db.clone(),
            transport,
            Arc::new(Unauthenticated),
            SyncConfig {
                batch_size,
                inter_batch_delay: Duration::ZERO,
                aggregation: AggregationConfig::default(),
            },
        )
    }

    async fn unsynced_ids(db: &Database) -> Vec<i64> {
        db.unsynced_activities()
            .await
            .unwrap()
            .into_iter()
            .map(|sample| sample.id)
            .collect()
    }

    #[tokio::test]
    async fn empty_store_is_nothing_to_sync() {
        let (_dir, db) = open();
        let transport = Arc::new(FakeTransport::default());
        let engine = engine(&db, transport.clone(), 100);

        let outcome = engine.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::NothingToSync);
        assert!(outcome.is_success());
        assert!(transport.sent().is_empty());
        assert_eq!(engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn malformed_rows_yield_no_sessions() {
        let (_dir, db) = open();
        db.execute(|conn| {
            conn.execute(
                "INSERT INTO activities (created_at, window_title, process_name, process_path)
                 VALUES ('garbage', 'w', 'p', '/p')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let transport = Arc::new(FakeTransport::default());
        let engine = engine(&db, transport.clone(), 100);

        let outcome = engine.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoSessions { raw_records: 1 });
        assert!(!outcome.is_success());
        assert!(transport.sent().is_empty());
        assert_eq!(unsynced_ids(&db).await.len(), 1);
    }

    #[tokio::test]
    async fn single_batch_commits_covered_ids_only() {
        let (_dir, db) = open();
        let ids = seed_distinct(&db, 3).await;
        db.execute(|conn| {
            conn.execute(
                "INSERT INTO activities (created_at, window_title, process_name, process_path)
                 VALUES ('not a time', 'w', 'p', '/p')",
                [],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .unwrap();

        let transport = Arc::new(FakeTransport::default());
        let engine = engine(&db, transport.clone(), 100);

        let outcome = engine.run_cycle().await.unwrap();
        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected completed cycle");
        };
        assert_eq!(report.raw_records, 4);
        assert_eq!(report.total_batches, 1);
        assert_eq!(report.synced_sessions, 3);
        assert_eq!(report.synced_records, 3);
        assert!(report.failures.is_empty());

        let remaining = unsynced_ids(&db).await;
        assert_eq!(remaining.len(), 1);
        assert!(!ids.contains(&remaining[0]));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].metadata.total_records, 3);
        assert_eq!(sent[0].metadata.total_sessions, 3);
        assert!(sent[0].user_id.is_none());
    }

    #[tokio::test]
    async fn failed_batch_leaves_only_its_ids_unsynced() {
        let (_dir, db) = open();
        let ids = seed_distinct(&db, 5).await;

        let transport = Arc::new(FakeTransport::with_responses(vec![
            Ok(()),
            Err(TransmissionError::Status(500)),
            Ok(()),
        ]));
        let engine = engine(&db, transport.clone(), 2);

        let CycleOutcome::Completed(report) = engine.run_cycle().await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert_eq!(report.total_batches, 3);
        assert_eq!(report.succeeded_batches, 2);
        assert_eq!(report.synced_records, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].batch, 2);
        assert_eq!(report.failures[0].stage, FailureStage::Transmission);

        // one attempt per batch, no retries inside the cycle
        assert_eq!(transport.sent().len(), 3);
        assert_eq!(unsynced_ids(&db).await, ids[2..4].to_vec());

        // the next cycle re-sends exactly the failed batch
        let CycleOutcome::Completed(retry) = engine.run_cycle().await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert_eq!(retry.synced_records, 2);
        assert!(unsynced_ids(&db).await.is_empty());
    }

    #[tokio::test]
    async fn batches_preserve_session_order() {
        let (_dir, db) = open();
        seed_distinct(&db, 205).await;

        let transport = Arc::new(FakeTransport::default());
        let engine = engine(&db, transport.clone(), 100);

        let CycleOutcome::Completed(report) = engine.run_cycle().await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert_eq!(report.total_batches, 3);

        let sent = transport.sent();
        let sizes: Vec<_> = sent.iter().map(|p| p.activities.len()).collect();
        assert_eq!(sizes, vec![100, 100, 5]);

        let names: Vec<_> = sent
            .iter()
            .flat_map(|p| p.activities.iter().map(|a| a.process_name.clone()))
            .collect();
        let expected: Vec<_> = (0..205).map(|i| format!("app{i}")).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn credentials_flow_into_payload_and_headers() {
        let (_dir, db) = open();
        seed_distinct(&db, 1).await;

        let transport = Arc::new(FakeTransport::default());
        let engine = SyncEngine::new(
            db.clone(),
            transport.clone(),
            Arc::new(SignedIn),
            SyncConfig::default(),
        );
        engine.run_cycle().await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].0.user_id.as_deref(), Some("user-7"));
        assert_eq!(
            sent[0].1,
            vec![(
                "Cookie".to_string(),
                "better-auth.session_token=t".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped() {
        let (_dir, db) = open();
        seed_distinct(&db, 2).await;

        let gate = Arc::new(Notify::new());
        let transport = Arc::new(FakeTransport {
            gate: Some(gate.clone()),
            ..FakeTransport::default()
        });
        let engine = Arc::new(engine(&db, transport.clone(), 100));
        let mut phases = engine.subscribe();

        let running = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_cycle().await }
        });

        phases
            .wait_for(|phase| *phase == SyncPhase::Transmitting)
            .await
            .unwrap();
        assert!(engine.is_syncing());
        assert_eq!(engine.run_cycle().await.unwrap(), CycleOutcome::Skipped);

        gate.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(_)));
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(engine.cycles_run(), 1);
        assert!(!engine.is_syncing());
        assert_eq!(engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn waits_between_batches() {
        let (_dir, db) = open();
        seed_distinct(&db, 3).await;

        let transport = Arc::new(FakeTransport::default());
        let engine = SyncEngine::new(
            db.clone(),
            transport.clone(),
            Arc::new(Unauthenticated),
            SyncConfig {
                batch_size: 1,
                inter_batch_delay: Duration::from_millis(100),
                aggregation: AggregationConfig::default(),
            },
        );

        let started = std::time::Instant::now();
        engine.run_cycle().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn editor_browser_scenario_syncs_two_sessions() {
        let (_dir, db) = open();
        let policy = CoalescePolicy::default();
        let mut browser = reading("Browser");
        browser.browser_url = Some("https://example.com".into());
        browser.browser_tab_title = Some("Example".into());

        for (offset, r) in [(0, reading("Editor")), (5, reading("Editor")), (10, reading("Editor"))]
            .into_iter()
            .chain([(20, browser.clone()), (25, browser)])
        {
            db.record_activity(&r, t0() + chrono::Duration::seconds(offset), &policy)
                .await
                .unwrap();
        }

        let transport = Arc::new(FakeTransport::default());
        let engine = engine(&db, transport.clone(), 100);
        engine.run_cycle().await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let activities = &sent[0].activities;
        assert_eq!(activities.len(), 2);
        assert_eq!(activities[0].process_name, "Editor");
        assert_eq!(activities[0].duration_seconds, 10);
        assert_eq!(activities[0].sample_count, 3);
        assert_eq!(activities[1].process_name, "Browser");
        assert_eq!(activities[1].browser_url, "https://example.com");
        assert_eq!(activities[1].duration_seconds, 5);
        assert_eq!(sent[0].metadata.total_records, 5);
        assert!(unsynced_ids(&db).await.is_empty());
    }

    #[tokio::test]
    async fn bad_row_does_not_block_good_rows() {
        let (_dir, db) = open();
        let ids = seed_distinct(&db, 2).await;
        db.execute(|conn| {
            conn.execute(
                "INSERT INTO activities (created_at, window_title, process_name, process_path, mouse_movements)
                 VALUES ('2024-03-01T09:00:30Z', 'w', 'p', '/p', -1)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let transport = Arc::new(FakeTransport::default());
        let engine = engine(&db, transport.clone(), 100);

        let CycleOutcome::Completed(report) = engine.run_cycle().await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert!(report.failures.is_empty());
        assert_eq!(report.synced_records, 2);
        assert!(unsynced_ids(&db).await.is_empty());
        assert_eq!(db.activity_stats().await.unwrap().unsynced_records, 1);

        let synced: Vec<i64> = db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM activities WHERE synced = 1 ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(ids)
            })
            .await
            .unwrap();
        assert_eq!(synced, ids);
    }

    #[tokio::test]
    async fn failed_commit_keeps_batch_unsynced() {
        let (_dir, db) = open();
        let ids = seed_distinct(&db, 2).await;
        db.execute(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER hold_sync BEFORE UPDATE OF synced ON activities
                 BEGIN SELECT RAISE(ABORT, 'store is read-only'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let transport = Arc::new(FakeTransport::default());
        let engine = engine(&db, transport.clone(), 100);

        let CycleOutcome::Completed(report) = engine.run_cycle().await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert_eq!(report.succeeded_batches, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Commit);
        assert_eq!(report.failures[0].records, 2);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(unsynced_ids(&db).await, ids);
        assert_eq!(engine.phase(), SyncPhase::Idle);

        // once the store accepts writes again the batch is re-sent and committed
        db.execute(|conn| {
            conn.execute_batch("DROP TRIGGER hold_sync;")?;
            Ok(())
        })
        .await
        .unwrap();
        let CycleOutcome::Completed(retry) = engine.run_cycle().await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert!(retry.failures.is_empty());
        assert_eq!(transport.sent().len(), 2);
        assert!(unsynced_ids(&db).await.is_empty());
    }
}
