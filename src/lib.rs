pub mod aggregation;
pub mod credentials;
pub mod db;
pub mod metrics;
pub mod models;
pub mod sensing;
pub mod settings;
pub mod sync;
mod utils;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use credentials::{CredentialProvider, StoredCredentials};
use db::{ActivityStats, Database};
use sensing::{CommandSource, SensingController};
use settings::Settings;
use sync::{CycleOutcome, HttpTransport, SyncController, SyncEngine};

pub fn init_logging() {
    // Reads RUST_LOG, defaults to info
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

pub fn open_database(settings: &Settings) -> Result<Database> {
    Database::new(settings.database_path())
}

/// Builds the sync engine, or `None` when no collector endpoint is set.
pub fn build_sync_engine(settings: &Settings, db: &Database) -> Result<Option<Arc<SyncEngine>>> {
    let Some(endpoint) = settings.api_endpoint() else {
        return Ok(None);
    };

    let transport = HttpTransport::new(
        endpoint,
        settings.api_key.clone(),
        settings.request_timeout(),
    )?;
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(StoredCredentials::new(settings.auth_path()));

    Ok(Some(Arc::new(SyncEngine::new(
        db.clone(),
        Arc::new(transport),
        credentials,
        settings.sync_config(),
    ))))
}

/// Runs capture and scheduled sync until Ctrl-C, then shuts both down.
pub async fn run(settings: Settings) -> Result<()> {
    info!("PulseTrack starting up...");

    let database = open_database(&settings)?;

    let stats = database.activity_stats().await?;
    if stats.unsynced_records > 0 {
        info!(
            "{} unsynced records left from a previous run",
            stats.unsynced_records
        );
    }

    let mut sensing = SensingController::new();
    match CommandSource::from_argv(&settings.capture_command) {
        Some(source) => {
            sensing.start_sensing(Arc::new(source), database.clone(), settings.capture_settings())?
        }
        None => warn!("No capture command configured; running sync only"),
    }

    let mut sync = match build_sync_engine(&settings, &database)? {
        Some(engine) => {
            let mut controller = SyncController::new(engine);
            controller.start(settings.sync_warmup(), settings.sync_period())?;
            Some(controller)
        }
        None => {
            warn!("No API endpoint configured; activities stay local");
            None
        }
    };

    if !sensing.is_running() && sync.is_none() {
        bail!("nothing to do: configure a capture command or an API endpoint");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");

    sensing.stop_sensing().await?;
    if let Some(controller) = sync.as_mut() {
        controller.shutdown().await?;
    }

    info!("PulseTrack stopped");
    Ok(())
}

pub async fn sync_once(settings: &Settings) -> Result<CycleOutcome> {
    let database = open_database(settings)?;
    let Some(engine) = build_sync_engine(settings, &database)? else {
        bail!("no API endpoint configured (set api_endpoint or API_ENDPOINT)");
    };
    engine.run_cycle().await
}

pub async fn stats(settings: &Settings) -> Result<ActivityStats> {
    open_database(settings)?.activity_stats().await
}
