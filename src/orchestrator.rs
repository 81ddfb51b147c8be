//! The orchestrator facade.
//!
//! Composes the registry, budget tracker, lifecycle controller, eviction
//! planner, mode manager, selection heuristic, usage tracker and status
//! publisher into one explicitly constructed object. There is no global
//! singleton: the application's composition root builds an `Orchestrator`
//! and passes it around by `Arc`, which also makes unit testing with fake
//! backends straightforward.

use crate::backend::InferenceBackend;
use crate::config::Catalog;
use crate::errors::GantryError;
use crate::eviction::EvictionPlanner;
use crate::lifecycle::LifecycleController;
use crate::modes::ModeManager;
use crate::publish::{StatusPublisher, StatusSnapshot, SubscriberId, build_snapshot};
use crate::registry::{BackendKind, ModelRegistry};
use crate::resources::{ResourceTracker, VramProbe};
use crate::selection::{SelectionHeuristic, SelectionRequest};
use crate::state::{StateMap, build_state_map};
use crate::usage::UsageTracker;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// TTL for the aggressively cached quick-status variant.
const QUICK_STATUS_TTL: Duration = Duration::from_secs(5);

/// Reduced status payload for high-frequency polling.
#[derive(Debug, Clone, Serialize)]
pub struct QuickStatus {
    pub current_mode: String,
    pub loaded_models: Vec<String>,
    pub used_gb: f64,
    pub available_gb: f64,
}

pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
    states: StateMap,
    resources: Arc<ResourceTracker>,
    backend: Arc<dyn InferenceBackend>,
    lifecycle: Arc<LifecycleController>,
    planner: Arc<EvictionPlanner>,
    modes: Arc<ModeManager>,
    selection: SelectionHeuristic,
    usage: UsageTracker,
    publisher: StatusPublisher,
    quick_cache: Mutex<Option<(QuickStatus, Instant)>>,
}

impl Orchestrator {
    /// Wire up the full component graph from a validated catalog.
    pub fn new(
        catalog: &Catalog,
        backend: Arc<dyn InferenceBackend>,
        probe: Arc<dyn VramProbe>,
    ) -> Self {
        let registry = Arc::new(catalog.build_registry());
        let states = build_state_map(registry.names());
        let resources = Arc::new(ResourceTracker::new(
            probe,
            catalog.budget.total_capacity_gb,
            catalog.budget.reserved_margin_gb,
            Duration::from_secs(catalog.budget.refresh_interval_secs),
        ));
        let publisher = StatusPublisher::new(
            Arc::clone(&registry),
            Arc::clone(&states),
            Arc::clone(&resources),
        );
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&states),
            Arc::clone(&backend),
            publisher.sink(),
        ));
        let planner = Arc::new(EvictionPlanner::new(
            Arc::clone(&lifecycle),
            Arc::clone(&resources),
            Arc::clone(&registry),
            Arc::clone(&states),
        ));
        let modes = Arc::new(ModeManager::new(
            catalog.modes.clone(),
            catalog.initial_mode(),
            Arc::clone(&lifecycle),
            Arc::clone(&planner),
            Arc::clone(&registry),
        ));
        let selection = SelectionHeuristic::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            Arc::clone(&planner),
            Arc::clone(&modes),
            catalog.selection.long_context_threshold,
        );
        let usage = UsageTracker::new(Arc::clone(&states));

        info!(
            models = registry.len(),
            modes = modes.mode_names().len(),
            capacity_gb = resources.total_capacity_gb(),
            "orchestrator ready"
        );

        Self {
            registry,
            states,
            resources,
            backend,
            lifecycle,
            planner,
            modes,
            selection,
            usage,
            publisher,
            quick_cache: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn current_mode(&self) -> String {
        self.modes.current_mode()
    }

    /// Full status snapshot: every descriptor, runtime state, and the budget.
    pub async fn get_status(&self) -> StatusSnapshot {
        build_snapshot(&self.registry, &self.states, &self.resources).await
    }

    /// Reduced snapshot, cached for ~5s, for high-frequency polling.
    pub async fn get_quick_status(&self) -> QuickStatus {
        let mut cache = self.quick_cache.lock().await;
        if let Some((status, at)) = &*cache {
            if at.elapsed() < QUICK_STATUS_TTL {
                return status.clone();
            }
        }

        let used_gb = self.resources.usage_gb().await;
        let status = QuickStatus {
            current_mode: self.modes.current_mode(),
            loaded_models: self
                .registry
                .all()
                .filter(|d| self.lifecycle.is_loaded(&d.name))
                .map(|d| d.name.clone())
                .collect(),
            used_gb,
            available_gb: self.resources.total_capacity_gb()
                - self.resources.reserved_margin_gb()
                - used_gb,
        };
        *cache = Some((status.clone(), Instant::now()));
        status
    }

    /// Ensure a model is Loaded. Returns false when the load failed; the
    /// cause lands in the model's `error_detail`.
    pub async fn load(&self, name: &str) -> Result<bool, GantryError> {
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| GantryError::UnknownModel(name.to_string()))?;
        Ok(self.lifecycle.load(&descriptor, &self.planner).await)
    }

    /// Release a model from its runtime. False for container-backed models
    /// and for in-flight transitions.
    pub async fn unload(&self, name: &str) -> Result<bool, GantryError> {
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| GantryError::UnknownModel(name.to_string()))?;
        Ok(self.lifecycle.unload(&descriptor).await)
    }

    /// Generation-path guarantee that a specific model is ready before
    /// inference. Semantically a load; named separately because callers use
    /// it as a readiness gate rather than a management action.
    pub async fn switch_to(&self, name: &str) -> Result<bool, GantryError> {
        debug!(model = %name, "switch_to requested");
        self.load(name).await
    }

    /// Switch the resident model set to a named mode. Fail-forward; see
    /// [`ModeManager::switch_mode`].
    pub async fn switch_mode(&self, mode: &str) -> Result<HashMap<String, bool>, GantryError> {
        self.modes.switch_mode(mode).await
    }

    /// Pick a model for a request. May trigger loads; best-effort result.
    pub async fn select(&self, request: &SelectionRequest) -> Option<String> {
        self.selection.select(request).await
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&StatusSnapshot) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.publisher.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.publisher.unsubscribe(id)
    }

    /// Broadcast receiver of snapshots for the SSE live-status feed.
    pub fn snapshot_stream(&self) -> tokio::sync::broadcast::Receiver<StatusSnapshot> {
        self.publisher.snapshot_stream()
    }

    /// Last recorded failure detail for a model, if any.
    pub fn error_detail(&self, name: &str) -> Option<String> {
        self.states.get(name).and_then(|e| e.snapshot().error_detail)
    }

    /// Ask each local runtime which models it already has resident and log
    /// the inventory. Purely informational; runtime states still start
    /// Unloaded.
    pub async fn log_runtime_inventory(&self) {
        let endpoints: HashSet<_> = self
            .registry
            .all()
            .filter(|d| d.backend == BackendKind::LocalRuntime)
            .map(|d| d.endpoint.clone())
            .collect();

        for endpoint in endpoints {
            match self.backend.list_models(&endpoint).await {
                Ok(models) => {
                    info!(endpoint = %endpoint, resident = ?models, "runtime inventory");
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "runtime inventory unavailable");
                }
            }
        }
    }
}
