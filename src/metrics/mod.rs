mod types;

pub use types::SystemLoad;

use std::sync::Arc;
use sysinfo::System;
use tokio::sync::Mutex;

/// Samples global CPU and memory usage for capture readings that arrive
/// without their own figures.
pub struct SystemMetricsSampler {
    inner: Arc<Mutex<System>>,
}

impl SystemMetricsSampler {
    pub fn new() -> Self {
        let mut system = System::new();

        // CPU usage is a delta between refreshes, so take a baseline now.
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            inner: Arc::new(Mutex::new(system)),
        }
    }

    pub async fn sample(&self) -> SystemLoad {
        let mut system = self.inner.lock().await;
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = (total > 0)
            .then(|| round2(system.used_memory() as f64 / total as f64 * 100.0));

        SystemLoad {
            cpu_percent: round2(f64::from(system.global_cpu_usage())),
            memory_percent,
        }
    }
}

impl Default for SystemMetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SystemMetricsSampler {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
