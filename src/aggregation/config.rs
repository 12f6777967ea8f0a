/// Tunables for turning raw samples into sessions.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Largest gap between a session's end and the next sample that still
    /// extends the session.
    pub max_gap_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { max_gap_secs: 15 }
    }
}
