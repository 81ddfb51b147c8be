//! Accelerator memory accounting.
//!
//! The tracker polls a telemetry probe for the accelerator's current memory
//! usage and caches the reading so high-frequency callers do not hammer the
//! telemetry source. Usage is observed, never owned: the true number belongs
//! to the driver, and the budget math here is deliberately approximate.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Source of "how much accelerator memory is in use right now".
#[async_trait]
pub trait VramProbe: Send + Sync {
    /// Used memory in GB, or `None` when the telemetry source is unavailable.
    async fn used_gb(&self) -> Option<f64>;
}

/// Probe backed by `nvidia-smi`. Sums usage across all visible devices.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    timeout: Duration,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl VramProbe for NvidiaSmiProbe {
    async fn used_gb(&self) -> Option<f64> {
        let command = tokio::process::Command::new("nvidia-smi")
            .args(["--query-gpu=memory.used", "--format=csv,noheader,nounits"])
            .output();

        let output = match tokio::time::timeout(self.timeout, command).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!(status = %output.status, "nvidia-smi exited non-zero");
                return None;
            }
            Ok(Err(e)) => {
                debug!(error = %e, "nvidia-smi not runnable");
                return None;
            }
            Err(_) => {
                debug!("nvidia-smi timed out");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut total_mib = 0.0;
        for line in stdout.lines() {
            match line.trim().parse::<f64>() {
                Ok(mib) => total_mib += mib,
                Err(_) => {
                    debug!(line = %line, "unparseable nvidia-smi output line");
                    return None;
                }
            }
        }
        Some(total_mib / 1024.0)
    }
}

/// Cached view of the accelerator memory budget.
pub struct ResourceTracker {
    probe: Arc<dyn VramProbe>,
    total_capacity_gb: f64,
    reserved_margin_gb: f64,
    refresh_interval: Duration,
    cached: Mutex<Option<(f64, Instant)>>,
}

impl ResourceTracker {
    pub fn new(
        probe: Arc<dyn VramProbe>,
        total_capacity_gb: f64,
        reserved_margin_gb: f64,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            probe,
            total_capacity_gb,
            reserved_margin_gb,
            refresh_interval,
            cached: Mutex::new(None),
        }
    }

    pub fn total_capacity_gb(&self) -> f64 {
        self.total_capacity_gb
    }

    pub fn reserved_margin_gb(&self) -> f64 {
        self.reserved_margin_gb
    }

    /// Current used memory in GB, refreshed at most once per interval.
    ///
    /// When the probe is unavailable this returns 0 rather than failing: the
    /// orchestrator then behaves as if capacity were abundant, an accepted
    /// risk for a single-operator deployment.
    pub async fn usage_gb(&self) -> f64 {
        let mut cached = self.cached.lock().await;
        if let Some((value, at)) = *cached {
            if at.elapsed() < self.refresh_interval {
                return value;
            }
        }

        let value = match self.probe.used_gb().await {
            Some(gb) => gb,
            None => {
                warn!("accelerator telemetry unavailable, treating usage as 0");
                0.0
            }
        };
        *cached = Some((value, Instant::now()));
        value
    }

    /// Budget headroom: capacity minus the safety margin minus current usage.
    pub async fn available_gb(&self) -> f64 {
        self.total_capacity_gb - self.reserved_margin_gb - self.usage_gb().await
    }

    /// Drop the cached reading so the next query re-polls the probe. Called
    /// after bulk unloads, where the cached number is known stale.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
