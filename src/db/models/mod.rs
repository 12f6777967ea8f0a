pub mod activity;

pub use activity::{ActivitySample, ActivityStats, CaptureReading, CoalescePolicy, RecordOutcome};
