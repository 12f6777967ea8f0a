pub mod controller;
pub mod engine;
pub mod error;
pub mod payload;
pub mod transport;

pub use controller::SyncController;
pub use engine::{BatchFailure, CycleOutcome, CycleReport, FailureStage, SyncConfig, SyncEngine, SyncPhase};
pub use error::TransmissionError;
pub use payload::SyncPayload;
pub use transport::{HttpTransport, SessionTransport};
