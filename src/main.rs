use std::path::PathBuf;
use std::process;

use clap::Parser;
use pulsetrack_lib::settings::Settings;
use pulsetrack_lib::sync::CycleOutcome;

#[derive(Parser, Debug)]
#[command(author, version, about = "Background activity tracker with periodic sync")]
struct Args {
    #[arg(long, help = "Settings file to use", value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, help = "Run one sync cycle and exit")]
    sync_once: bool,

    #[arg(long, help = "Print record counts and exit")]
    stats: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    pulsetrack_lib::init_logging();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = Settings::load(args.config.as_deref())?;

    if args.stats {
        let stats = pulsetrack_lib::stats(&settings).await?;
        println!("Total records:    {}", stats.total_records);
        println!("Unsynced records: {}", stats.unsynced_records);
        return Ok(());
    }

    if args.sync_once {
        match pulsetrack_lib::sync_once(&settings).await? {
            CycleOutcome::Skipped => println!("Sync already running"),
            CycleOutcome::NothingToSync => println!("Nothing to sync"),
            CycleOutcome::NoSessions { raw_records } => {
                anyhow::bail!("{raw_records} unsynced records produced no sessions")
            }
            CycleOutcome::Completed(report) => {
                println!(
                    "Synced {} sessions ({} records) in {}/{} batches",
                    report.synced_sessions,
                    report.synced_records,
                    report.succeeded_batches,
                    report.total_batches
                );
                if let Some(failure) = report.failures.first() {
                    anyhow::bail!(
                        "{} batch(es) failed, first: batch {}: {}",
                        report.failures.len(),
                        failure.batch,
                        failure.error
                    );
                }
            }
        }
        return Ok(());
    }

    pulsetrack_lib::run(settings).await
}
