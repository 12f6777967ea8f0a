use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{CoalescePolicy, Database, RecordOutcome},
    metrics::SystemMetricsSampler,
};

use super::source::ActivitySource;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interval: Duration,
    /// Upper bound for one tick, source call and store write included.
    pub timeout: Duration,
    pub policy: CoalescePolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            policy: CoalescePolicy::default(),
        }
    }
}

pub async fn capture_loop(
    source: Arc<dyn ActivitySource>,
    metrics: SystemMetricsSampler,
    db: Database,
    settings: CaptureSettings,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let timestamp = Utc::now();
                let fut = perform_capture(source.as_ref(), &metrics, &db, &settings.policy, timestamp);

                match tokio::time::timeout(settings.timeout, fut).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => log_error!("activity capture failed: {err:#}"),
                    Err(_) => log_warn!("activity capture timeout (> {:?})", settings.timeout),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                break;
            }
        }
    }
}

async fn perform_capture(
    source: &dyn ActivitySource,
    metrics: &SystemMetricsSampler,
    db: &Database,
    policy: &CoalescePolicy,
    timestamp: DateTime<Utc>,
) -> Result<Option<RecordOutcome>> {
    let Some(mut reading) = source.capture().await.context("capture source failed")? else {
        log_debug!("No foreground window at {timestamp}");
        return Ok(None);
    };

    if reading.cpu_usage_percent.is_none() || reading.memory_usage_percent.is_none() {
        let load = metrics.sample().await;
        reading.cpu_usage_percent.get_or_insert(load.cpu_percent);
        if reading.memory_usage_percent.is_none() {
            reading.memory_usage_percent = load.memory_percent;
        }
    }

    let outcome = db
        .record_activity(&reading, timestamp, policy)
        .await
        .context("failed to persist activity sample")?;

    match outcome {
        RecordOutcome::Inserted(id) => {
            let active = if reading.is_user_active { "active" } else { "idle" };
            match &reading.browser_url {
                Some(url) => log_info!("Tracked #{id} ({active}): {} - {url}", reading.process_name),
                None => log_info!(
                    "Tracked #{id} ({active}): {} - {}",
                    reading.process_name,
                    reading.window_title
                ),
            }
        }
        RecordOutcome::Coalesced(id) => {
            log_debug!("Extended idle sample #{id} ({})", reading.process_name);
        }
    }

    Ok(Some(outcome))
}
