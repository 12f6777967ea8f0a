use std::time::Duration;

use thiserror::Error;

/// Why one batch failed to reach the collector. Always scoped to a single
/// batch; the next cycle re-sends whatever stayed unsynced.
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("collector responded with status {0}")]
    Status(u16),
    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },
}

impl TransmissionError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(code) => Some(*code),
            _ => None,
        }
    }
}
