pub mod algorithm;
pub mod config;

pub use algorithm::{aggregate_sessions, Aggregation};
pub use config::AggregationConfig;
