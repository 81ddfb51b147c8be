//! Per-model runtime state shared between the lifecycle controller and the
//! usage tracker.
//!
//! Each registered model gets one [`ModelEntry`]. The mutable fields sit
//! behind a plain mutex (never held across an await point); the status is
//! additionally mirrored into a `watch` channel, which doubles as the
//! per-model in-flight marker: a caller that observes `Loading` awaits the
//! channel instead of issuing a second backend call.

use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;

/// Lifecycle status of a model.
///
/// Legal transitions: Unloaded→Loading→{Loaded, Error},
/// Loaded→Unloading→Unloaded. Error is terminal until an explicit reload
/// attempt (Error→Loading).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Unloaded => "unloaded",
            ModelStatus::Loading => "loading",
            ModelStatus::Loaded => "loaded",
            ModelStatus::Unloading => "unloading",
            ModelStatus::Error => "error",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime fields for one model.
#[derive(Debug, Clone)]
pub struct ModelRuntime {
    pub status: ModelStatus,
    pub last_used: Option<Instant>,
    pub load_started_at: Option<Instant>,
    /// Exponential moving average of observed throughput.
    pub tokens_per_second: f64,
    pub total_tokens: u64,
    pub active_requests: usize,
    pub error_detail: Option<String>,
}

impl Default for ModelRuntime {
    fn default() -> Self {
        Self {
            status: ModelStatus::Unloaded,
            last_used: None,
            load_started_at: None,
            tokens_per_second: 0.0,
            total_tokens: 0,
            active_requests: 0,
            error_detail: None,
        }
    }
}

/// Shared state cell for one registered model.
#[derive(Debug)]
pub struct ModelEntry {
    runtime: Mutex<ModelRuntime>,
    status_tx: watch::Sender<ModelStatus>,
}

impl Default for ModelEntry {
    fn default() -> Self {
        let (status_tx, _) = watch::channel(ModelStatus::Unloaded);
        Self {
            runtime: Mutex::new(ModelRuntime::default()),
            status_tx,
        }
    }
}

impl ModelEntry {
    fn lock(&self) -> MutexGuard<'_, ModelRuntime> {
        // A poisoned lock just means a panicking thread died mid-update;
        // the runtime fields are all independently valid.
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> ModelStatus {
        self.lock().status.clone()
    }

    pub fn snapshot(&self) -> ModelRuntime {
        self.lock().clone()
    }

    /// Run a closure over the runtime fields under the lock.
    pub fn with_runtime<R>(&self, f: impl FnOnce(&mut ModelRuntime) -> R) -> R {
        f(&mut self.lock())
    }

    /// Apply a status transition and broadcast it on the watch channel.
    ///
    /// Status-dependent bookkeeping is centralized here: Loading stamps
    /// `load_started_at`, Loaded stamps `last_used` and clears any stale
    /// error, Error records the detail message.
    pub fn set_status(&self, next: ModelStatus, detail: Option<String>) -> ModelStatus {
        let previous = {
            let mut runtime = self.lock();
            let previous = std::mem::replace(&mut runtime.status, next.clone());
            match &next {
                ModelStatus::Loading => {
                    runtime.load_started_at = Some(Instant::now());
                }
                ModelStatus::Loaded => {
                    runtime.last_used = Some(Instant::now());
                    runtime.load_started_at = None;
                    runtime.error_detail = None;
                }
                ModelStatus::Error => {
                    runtime.load_started_at = None;
                    runtime.error_detail = detail;
                }
                ModelStatus::Unloaded | ModelStatus::Unloading => {}
            }
            previous
        };
        self.status_tx.send_replace(next);
        previous
    }

    /// Subscribe to status transitions. The receiver always sees the current
    /// value first, so there is no lost-wakeup window between a status check
    /// and the await.
    pub fn watch_status(&self) -> watch::Receiver<ModelStatus> {
        self.status_tx.subscribe()
    }
}

/// Map of model name to its shared state entry. Built once from the registry
/// and never resized afterwards.
pub type StateMap = Arc<DashMap<String, Arc<ModelEntry>>>;

/// Build the state map for a set of model names.
pub fn build_state_map(names: impl IntoIterator<Item = String>) -> StateMap {
    let map = DashMap::new();
    for name in names {
        map.insert(name, Arc::new(ModelEntry::default()));
    }
    Arc::new(map)
}

/// Fetch the entry for a registered model.
///
/// The map is constructed from the registry and immutable afterwards, so a
/// miss is a programmer error rather than a runtime condition.
pub fn entry_for(states: &StateMap, name: &str) -> Arc<ModelEntry> {
    states
        .get(name)
        .map(|e| Arc::clone(e.value()))
        .expect("state entry exists for every registered model")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_transition_stamps_last_used_and_clears_error() {
        let entry = ModelEntry::default();
        entry.set_status(ModelStatus::Loading, None);
        entry.set_status(ModelStatus::Error, Some("warm-up failed".into()));
        assert_eq!(entry.snapshot().error_detail.as_deref(), Some("warm-up failed"));

        entry.set_status(ModelStatus::Loading, None);
        let previous = entry.set_status(ModelStatus::Loaded, None);
        assert_eq!(previous, ModelStatus::Loading);

        let runtime = entry.snapshot();
        assert!(runtime.last_used.is_some());
        assert!(runtime.load_started_at.is_none());
        assert!(runtime.error_detail.is_none());
    }

    #[tokio::test]
    async fn watch_sees_current_value_immediately() {
        let entry = ModelEntry::default();
        entry.set_status(ModelStatus::Loading, None);
        entry.set_status(ModelStatus::Loaded, None);

        // Subscribing after the transitions must still resolve: wait_for
        // inspects the current value before waiting.
        let mut rx = entry.watch_status();
        let status = rx
            .wait_for(|s| !matches!(s, ModelStatus::Loading))
            .await
            .unwrap();
        assert_eq!(*status, ModelStatus::Loaded);
    }
}
