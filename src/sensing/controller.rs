use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::metrics::SystemMetricsSampler;

use super::loop_worker::{capture_loop, CaptureSettings};
use super::source::ActivitySource;

/// Owns the capture task. At most one capture loop runs per controller.
pub struct SensingController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl SensingController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start_sensing(
        &mut self,
        source: Arc<dyn ActivitySource>,
        db: Database,
        settings: CaptureSettings,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("sensing already active");
        }

        info!("Activity capture starting (every {:?})", settings.interval);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            source,
            SystemMetricsSampler::new(),
            db,
            settings,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Stops the loop after the tick in progress, if any, has finished.
    pub async fn stop_sensing(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("capture loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for SensingController {
    fn default() -> Self {
        Self::new()
    }
}
