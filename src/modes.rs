//! Named operating modes.
//!
//! A mode is an ordered set of models that should be simultaneously resident.
//! Switching is fail-forward: the target mode becomes current even when some
//! member loads fail, and the per-model outcome map tells the caller exactly
//! what happened. There is no rollback to the previous mode.

use crate::errors::GantryError;
use crate::eviction::EvictionPlanner;
use crate::lifecycle::LifecycleController;
use crate::registry::ModelRegistry;
use crate::state::ModelStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A named target set of resident models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDefinition {
    /// Members to load, in load order.
    pub models: Vec<String>,
    /// Solo modes run their single member exclusively: every other resident
    /// model is unloaded first, including ones eviction would protect.
    #[serde(default)]
    pub solo: bool,
    /// The model selection falls back to. Defaults to the first member.
    #[serde(default)]
    pub primary: Option<String>,
}

impl ModeDefinition {
    pub fn primary_model(&self) -> Option<&str> {
        self.primary
            .as_deref()
            .or_else(|| self.models.first().map(String::as_str))
    }
}

pub struct ModeManager {
    modes: HashMap<String, ModeDefinition>,
    current: RwLock<String>,
    lifecycle: Arc<LifecycleController>,
    planner: Arc<EvictionPlanner>,
    registry: Arc<ModelRegistry>,
    /// Serializes mode switches; two overlapping switches would interleave
    /// their unload/load phases.
    switch_lock: Mutex<()>,
}

impl ModeManager {
    pub fn new(
        modes: HashMap<String, ModeDefinition>,
        initial_mode: String,
        lifecycle: Arc<LifecycleController>,
        planner: Arc<EvictionPlanner>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            modes,
            current: RwLock::new(initial_mode),
            lifecycle,
            planner,
            registry,
            switch_lock: Mutex::new(()),
        }
    }

    pub fn current_mode(&self) -> String {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn mode_names(&self) -> Vec<String> {
        self.modes.keys().cloned().collect()
    }

    pub fn definition(&self, name: &str) -> Option<&ModeDefinition> {
        self.modes.get(name)
    }

    /// The current mode's designated primary model.
    pub fn primary_model(&self) -> Option<String> {
        let current = self.current_mode();
        self.modes
            .get(&current)
            .and_then(|mode| mode.primary_model())
            .map(str::to_string)
    }

    /// Switch the resident model set to the named mode.
    ///
    /// Returns a per-model success map for the target set. The mode is
    /// recorded as current before the loads run, so a partial failure leaves
    /// the system in the new mode with the failures visible per model.
    pub async fn switch_mode(&self, name: &str) -> Result<HashMap<String, bool>, GantryError> {
        let mode = self
            .modes
            .get(name)
            .ok_or_else(|| GantryError::UnknownMode(name.to_string()))?;

        let _guard = self.switch_lock.lock().await;
        info!(mode = %name, solo = mode.solo, members = ?mode.models, "switching mode");

        // Phase 1: evict residents that are not part of the target set. Solo
        // modes bypass all eviction protection by unloading directly.
        for descriptor in self.registry.all() {
            if mode.models.iter().any(|m| m == &descriptor.name) {
                continue;
            }
            if self.lifecycle.status(&descriptor.name) != ModelStatus::Loaded {
                continue;
            }
            if !self.lifecycle.unload(descriptor).await {
                warn!(mode = %name, model = %descriptor.name, "could not unload non-member model");
            }
        }

        {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            *current = name.to_string();
        }

        // Phase 2: load members in list order, fail-forward.
        let mut results = HashMap::with_capacity(mode.models.len());
        for member in &mode.models {
            let Some(descriptor) = self.registry.get(member) else {
                // Validated at config load; defensive here because mode
                // definitions can in principle outlive catalog edits.
                warn!(mode = %name, model = %member, "mode references unknown model");
                results.insert(member.clone(), false);
                continue;
            };
            let loaded = self.lifecycle.load(&descriptor, &self.planner).await;
            results.insert(member.clone(), loaded);
        }

        info!(mode = %name, ?results, "mode switch complete");
        Ok(results)
    }
}
