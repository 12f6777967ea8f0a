use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Message {
    Run(Job),
    Close,
}

/// Owns the store thread. Dropping the last `Database` clone closes it and
/// waits for queued jobs to drain.
struct StoreThread {
    jobs: mpsc::Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreThread {
    fn drop(&mut self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let Some(handle) = handle else { return };
        if self.jobs.send(Message::Close).is_err() {
            warn!("Activity store thread already gone");
        }
        if handle.join().is_err() {
            error!("Activity store thread panicked");
        }
    }
}

/// Handle to the activity log. Every operation is shipped to a single
/// worker thread that owns the SQLite connection, so operations never
/// interleave with each other.
#[derive(Clone)]
pub struct Database {
    thread: Arc<StoreThread>,
    path: Arc<PathBuf>,
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open activity log at {}", path.display()))?;

    // Readers (`--stats`) may open the file while the agent writes.
    conn.busy_timeout(Duration::from_secs(5))?;
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        warn!("Could not switch activity log to WAL: {err}");
    }

    run_migrations(&mut conn).context("failed to migrate activity log")?;
    Ok(conn)
}

fn serve(mut conn: Connection, jobs: mpsc::Receiver<Message>) {
    for message in jobs {
        match message {
            Message::Run(job) => job(&mut conn),
            Message::Close => break,
        }
    }
    info!("Activity store thread stopped");
}

impl Database {
    /// Opens (or creates) the log at `path` and brings its schema up to date.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let (jobs_tx, jobs_rx) = mpsc::channel::<Message>();
        let (opened_tx, opened_rx) = mpsc::channel::<Result<()>>();
        let thread_path = path.clone();

        let handle = thread::Builder::new()
            .name("pulsetrack-db".into())
            .spawn(move || match open_connection(&thread_path) {
                Ok(conn) => {
                    if opened_tx.send(Ok(())).is_ok() {
                        serve(conn, jobs_rx);
                    }
                }
                Err(err) => {
                    let _ = opened_tx.send(Err(err));
                }
            })
            .context("failed to spawn activity store thread")?;

        opened_rx
            .recv()
            .context("activity store thread exited during startup")??;

        info!("Activity log ready at {}", path.display());

        Ok(Self {
            thread: Arc::new(StoreThread {
                jobs: jobs_tx,
                handle: Mutex::new(Some(handle)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `task` on the store thread and hands back its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn: &mut Connection| {
            // The caller may have given up (e.g. a capture tick timed out).
            let _ = reply_tx.send(task(conn));
        });

        self.thread
            .jobs
            .send(Message::Run(job))
            .map_err(|_| anyhow!("activity store is closed"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("activity store thread stopped before replying"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_missing_directories_and_runs_jobs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/agent/activity.sqlite3");
        let db = Database::new(path.clone()).unwrap();
        assert_eq!(db.path(), path.as_path());

        let count: i64 = db
            .execute(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn job_errors_reach_the_caller() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("activity.sqlite3")).unwrap();

        let result: Result<()> = db
            .execute(|conn| {
                conn.execute("SELECT * FROM no_such_table", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        // the thread keeps serving after a failed job
        assert!(db.execute(|_| Ok(1)).await.is_ok());
    }
}
