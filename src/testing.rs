//! Test doubles for the backend and telemetry seams.
//!
//! Used by this crate's own tests and available to downstream integration
//! tests that want an orchestrator with no real serving infrastructure.

use crate::errors::BackendError;
use crate::registry::ModelDescriptor;
use crate::resources::VramProbe;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

/// Scriptable [`crate::backend::InferenceBackend`]: records calls per model
/// and fails on demand.
#[derive(Default)]
pub struct StubBackend {
    warm_counts: DashMap<String, usize>,
    stop_counts: DashMap<String, usize>,
    warm_failures: DashSet<String>,
    stop_failures: DashSet<String>,
    warm_delay: Mutex<Option<Duration>>,
}

impl StubBackend {
    pub fn warm_calls(&self, model: &str) -> usize {
        self.warm_counts.get(model).map(|c| *c).unwrap_or(0)
    }

    pub fn stop_calls(&self, model: &str) -> usize {
        self.stop_counts.get(model).map(|c| *c).unwrap_or(0)
    }

    /// Make warm calls for `model` fail until cleared.
    pub fn fail_warm(&self, model: &str) {
        self.warm_failures.insert(model.to_string());
    }

    pub fn clear_warm_failure(&self, model: &str) {
        self.warm_failures.remove(model);
    }

    /// Make stop calls for `model` fail.
    pub fn fail_stop(&self, model: &str) {
        self.stop_failures.insert(model.to_string());
    }

    /// Delay every warm call, to widen race windows in concurrency tests.
    pub fn set_warm_delay(&self, delay: Duration) {
        *self.warm_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }
}

#[async_trait]
impl crate::backend::InferenceBackend for StubBackend {
    async fn warm(&self, model: &ModelDescriptor) -> Result<(), BackendError> {
        let delay = *self.warm_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.warm_counts.entry(model.name.clone()).or_insert(0) += 1;
        if self.warm_failures.contains(&model.name) {
            return Err(BackendError::Unreachable("stubbed warm failure".into()));
        }
        Ok(())
    }

    async fn stop(&self, model: &ModelDescriptor) -> Result<(), BackendError> {
        *self.stop_counts.entry(model.name.clone()).or_insert(0) += 1;
        if self.stop_failures.contains(&model.name) {
            return Err(BackendError::Unreachable("stubbed stop failure".into()));
        }
        Ok(())
    }

    async fn list_models(&self, _endpoint: &Url) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }
}

/// Probe that returns a fixed (settable) reading.
pub struct StaticProbe {
    reading: Mutex<Option<f64>>,
}

impl StaticProbe {
    pub fn new(used_gb: f64) -> Self {
        Self {
            reading: Mutex::new(Some(used_gb)),
        }
    }

    /// Probe that behaves like absent telemetry.
    pub fn unavailable() -> Self {
        Self {
            reading: Mutex::new(None),
        }
    }

    pub fn set(&self, used_gb: f64) {
        *self.reading.lock().unwrap_or_else(|e| e.into_inner()) = Some(used_gb);
    }
}

#[async_trait]
impl VramProbe for StaticProbe {
    async fn used_gb(&self) -> Option<f64> {
        *self.reading.lock().unwrap_or_else(|e| e.into_inner())
    }
}
