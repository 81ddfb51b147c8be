//! Per-model lifecycle state machine.
//!
//! The controller owns every status transition. Loads are idempotent and
//! race-free: a caller that observes an in-flight `Loading` attaches to that
//! attempt through the model's status watch channel instead of issuing a
//! second warm call. Budget checking and the `Loading` reservation happen
//! under a single allocation lock, so two concurrent loads cannot both spend
//! the same freed memory; the warm call itself runs outside the lock and
//! loads of different models overlap freely.

use crate::backend::InferenceBackend;
use crate::eviction::EvictionPlanner;
use crate::publish::EventSink;
use crate::registry::{BackendKind, ModelDescriptor};
use crate::state::{ModelEntry, ModelStatus, StateMap, entry_for};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct LifecycleController {
    states: StateMap,
    backend: Arc<dyn InferenceBackend>,
    events: EventSink,
    /// Serializes ensure_available → status=Loading across concurrent loads.
    alloc_lock: Mutex<()>,
}

impl LifecycleController {
    pub fn new(states: StateMap, backend: Arc<dyn InferenceBackend>, events: EventSink) -> Self {
        Self {
            states,
            backend,
            events,
            alloc_lock: Mutex::new(()),
        }
    }

    fn transition(&self, name: &str, entry: &ModelEntry, next: ModelStatus, detail: Option<String>) {
        let previous = entry.set_status(next.clone(), detail);
        debug!(model = %name, from = %previous, to = %next, "lifecycle transition");
        self.events.model_changed(name, &next);
    }

    /// Wait for someone else's in-flight load attempt to settle.
    async fn attach_to_load(&self, name: &str, entry: &ModelEntry) -> bool {
        debug!(model = %name, "attaching to in-flight load");
        let mut rx = entry.watch_status();
        match rx.wait_for(|s| !matches!(s, ModelStatus::Loading)).await {
            Ok(status) => matches!(&*status, ModelStatus::Loaded),
            // Sender dropped: the entry was torn down mid-load, treat as failed.
            Err(_) => false,
        }
    }

    /// Ensure the model is Loaded, evicting other models if the budget is
    /// tight. Returns true once the model is ready; on failure the model is
    /// left in Error with the cause recorded in `error_detail`.
    pub async fn load(&self, descriptor: &ModelDescriptor, planner: &EvictionPlanner) -> bool {
        let entry = entry_for(&self.states, &descriptor.name);

        match entry.status() {
            ModelStatus::Loaded => return true,
            ModelStatus::Loading => return self.attach_to_load(&descriptor.name, &entry).await,
            _ => {}
        }

        let guard = self.alloc_lock.lock().await;
        // Re-check under the lock: another load may have won the race.
        match entry.status() {
            ModelStatus::Loaded => return true,
            ModelStatus::Loading => {
                drop(guard);
                return self.attach_to_load(&descriptor.name, &entry).await;
            }
            _ => {}
        }

        if !planner
            .ensure_available(descriptor.memory_cost_gb, true)
            .await
        {
            let detail = format!(
                "budget exceeded: could not free {:.1} GB for {}",
                descriptor.memory_cost_gb, descriptor.name
            );
            error!(model = %descriptor.name, "{detail}");
            self.transition(&descriptor.name, &entry, ModelStatus::Error, Some(detail));
            return false;
        }

        self.transition(&descriptor.name, &entry, ModelStatus::Loading, None);
        drop(guard);

        info!(model = %descriptor.name, memory_gb = descriptor.memory_cost_gb, "loading model");
        match self.backend.warm(descriptor).await {
            Ok(()) => {
                self.transition(&descriptor.name, &entry, ModelStatus::Loaded, None);
                info!(model = %descriptor.name, "model loaded");
                true
            }
            Err(e) => {
                let detail = e.to_string();
                error!(model = %descriptor.name, error = %detail, "model load failed");
                self.transition(&descriptor.name, &entry, ModelStatus::Error, Some(detail));
                false
            }
        }
    }

    /// Unload a model. Idempotent no-op when already Unloaded.
    ///
    /// Container-backed models are externally supervised fixed-capacity
    /// services; this controller cannot shrink them, so the call returns
    /// false and leaves their state untouched. For local runtimes a failed
    /// stop call is logged but the model is still marked Unloaded, since the
    /// alternative is a stuck busy-state.
    pub async fn unload(&self, descriptor: &ModelDescriptor) -> bool {
        let entry = entry_for(&self.states, &descriptor.name);

        match entry.status() {
            ModelStatus::Unloaded => return true,
            // Nothing resident to release; Error stays terminal until a
            // reload attempt.
            ModelStatus::Error => return true,
            ModelStatus::Loading | ModelStatus::Unloading => {
                warn!(
                    model = %descriptor.name,
                    status = %entry.status(),
                    "refusing unload while a transition is in flight"
                );
                return false;
            }
            ModelStatus::Loaded => {}
        }

        if descriptor.backend == BackendKind::AcceleratedContainer {
            warn!(
                model = %descriptor.name,
                "unload requested on externally supervised container backend"
            );
            return false;
        }

        self.transition(&descriptor.name, &entry, ModelStatus::Unloading, None);
        if let Err(e) = self.backend.stop(descriptor).await {
            warn!(
                model = %descriptor.name,
                error = %e,
                "stop call failed, marking unloaded anyway"
            );
        }
        self.transition(&descriptor.name, &entry, ModelStatus::Unloaded, None);
        info!(model = %descriptor.name, "model unloaded");
        true
    }

    pub fn status(&self, name: &str) -> ModelStatus {
        entry_for(&self.states, name).status()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.status(name) == ModelStatus::Loaded
    }
}
