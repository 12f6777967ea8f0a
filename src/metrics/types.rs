use serde::{Deserialize, Serialize};

/// Machine-wide load at one capture tick, as percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    pub cpu_percent: f64,
    pub memory_percent: Option<f64>,
}
