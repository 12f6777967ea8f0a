use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::db::models::CaptureReading;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to run capture command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capture command exited with {status}: {stderr}")]
    Failed {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("capture command produced invalid output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

/// Supplies the foreground window on each capture tick. `Ok(None)` means
/// there is nothing to record right now (no focused window).
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn capture(&self) -> Result<Option<CaptureReading>, CaptureError>;
}

/// Runs an external helper each tick and reads one JSON `CaptureReading`
/// from its stdout. Empty output means no foreground window.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ActivitySource for CommandSource {
    async fn capture(&self) -> Result<Option<CaptureReading>, CaptureError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CaptureError::Spawn {
                command: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CaptureError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(trimmed)?))
    }
}
