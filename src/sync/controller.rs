use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::engine::{CycleOutcome, SyncEngine};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Schedules sync cycles on a fixed period. Manual triggers go through the
/// same engine and share its one-cycle-at-a-time guard.
pub struct SyncController {
    engine: Arc<SyncEngine>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl SyncController {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle.is_some()
    }

    /// First cycle runs after `warmup`, then every `period`.
    pub fn start(&mut self, warmup: Duration, period: Duration) -> Result<()> {
        if self.handle.is_some() {
            bail!("sync already scheduled");
        }

        info!("Sync scheduled every {period:?} (first run in {warmup:?})");

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sync_schedule(
            self.engine.clone(),
            warmup,
            period,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancels future cycles without waiting. A cycle already running is
    /// left to finish; the returned handle resolves once it has.
    pub fn stop(&mut self) -> Option<JoinHandle<()>> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.handle.take()
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self.stop() {
            Some(handle) => handle.await.context("sync scheduler failed to join"),
            None => Ok(()),
        }
    }

    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        self.engine.run_cycle().await
    }
}

async fn sync_schedule(
    engine: Arc<SyncEngine>,
    warmup: Duration,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + warmup, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.run_cycle().await {
                    Ok(outcome) => report_outcome(&engine, &outcome).await,
                    Err(err) => log_error!("sync cycle failed: {err:#}"),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("sync scheduler shutting down");
                break;
            }
        }
    }
}

async fn report_outcome(engine: &SyncEngine, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped | CycleOutcome::NothingToSync => return,
        CycleOutcome::NoSessions { raw_records } => {
            log_warn!("sync produced no sessions from {raw_records} records");
        }
        CycleOutcome::Completed(report) if report.failures.is_empty() => {
            log_info!(
                "sync complete: {} sessions ({} records)",
                report.synced_sessions,
                report.synced_records
            );
        }
        CycleOutcome::Completed(report) => {
            log_warn!(
                "sync finished with {}/{} failed batches",
                report.failures.len(),
                report.total_batches
            );
        }
    }

    match engine.database().activity_stats().await {
        Ok(stats) => log_info!("{} records still unsynced", stats.unsynced_records),
        Err(err) => log_warn!("could not read activity stats: {err:#}"),
    }
}
