//! Utilization sampling.
//!
//! A sampler tick asks a [`UtilizationSource`] for the current aggregate
//! CPU figure and appends it to the state store, where the scaler's
//! sliding window picks it up.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{error, info};

use rudder_state::{StateStore, UtilizationSample};

/// Source of aggregate CPU utilization across Ready instances, as a
/// percentage of the per-instance allocation (may exceed 100 under
/// overload).
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    async fn sample(&self) -> anyhow::Result<f64>;
}

/// Fixed-value source. Stands in where no metrics agent reports real
/// figures (demos, tests); the value can be adjusted at runtime.
pub struct SimulatedSource {
    cpu_percent: std::sync::Mutex<f64>,
}

impl SimulatedSource {
    pub fn new(cpu_percent: f64) -> Self {
        Self {
            cpu_percent: std::sync::Mutex::new(cpu_percent),
        }
    }

    pub fn set(&self, cpu_percent: f64) {
        if let Ok(mut v) = self.cpu_percent.lock() {
            *v = cpu_percent;
        }
    }
}

#[async_trait]
impl UtilizationSource for SimulatedSource {
    async fn sample(&self) -> anyhow::Result<f64> {
        Ok(self.cpu_percent.lock().map(|v| *v).unwrap_or_default())
    }
}

/// Periodic sampling loop feeding the utilization window.
pub struct Sampler {
    state: StateStore,
    source: Box<dyn UtilizationSource>,
}

impl Sampler {
    pub fn new(state: StateStore, source: Box<dyn UtilizationSource>) -> Self {
        Self { state, source }
    }

    /// Take one sample and append it to the store.
    pub async fn sample_once(&self) -> anyhow::Result<()> {
        let cpu_percent = self.source.sample().await?;
        self.state.append_sample(&UtilizationSample {
            at: epoch_secs(),
            cpu_percent,
        })?;
        Ok(())
    }

    /// Run the sampling loop until shutdown.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "sampler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sample_once().await {
                        error!(error = %e, "utilization sample failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("sampler shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
