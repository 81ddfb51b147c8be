//! Request-to-model selection.
//!
//! A deterministic rule ladder maps the shape of an incoming request to a
//! model name. Selection is side-effecting: rules 1 and 4 may trigger a load
//! for their candidate, and the chosen name is returned best-effort even if
//! that load ultimately fails. Callers must re-check runtime status before
//! relying on the model being ready.

use crate::eviction::EvictionPlanner;
use crate::lifecycle::LifecycleController;
use crate::modes::ModeManager;
use crate::registry::{ComplexityBucket, ModelPurpose, ModelRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Broad shape of the incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Chat,
    Code,
    Summarization,
}

/// How consequential the request's domain is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    General,
    Technical,
    HighStakes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub request_type: RequestKind,
    pub complexity: ComplexityBucket,
    pub domain: Domain,
    /// Prompt size in tokens.
    pub context_size: u32,
}

pub struct SelectionHeuristic {
    registry: Arc<ModelRegistry>,
    lifecycle: Arc<LifecycleController>,
    planner: Arc<EvictionPlanner>,
    modes: Arc<ModeManager>,
    /// Context sizes above this prefer a long-context model (rule 3).
    long_context_threshold: u32,
}

impl SelectionHeuristic {
    pub fn new(
        registry: Arc<ModelRegistry>,
        lifecycle: Arc<LifecycleController>,
        planner: Arc<EvictionPlanner>,
        modes: Arc<ModeManager>,
        long_context_threshold: u32,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            planner,
            modes,
            long_context_threshold,
        }
    }

    /// Pick a model for the request. First matching rule wins:
    ///
    /// 1. Code-related work goes to the coding-purpose model, loading it if
    ///    needed.
    /// 2. High-stakes or high-complexity work prefers the largest *loaded*
    ///    reasoning model.
    /// 3. Oversized contexts prefer a loaded model whose window covers them.
    /// 4. Everything else goes to the current mode's primary model.
    pub async fn select(&self, request: &SelectionRequest) -> Option<String> {
        if request.request_type == RequestKind::Code {
            if let Some(descriptor) = self.registry.by_purpose(ModelPurpose::Coding).next() {
                let descriptor = Arc::clone(descriptor);
                debug!(model = %descriptor.name, "selection: coding model");
                if !self.lifecycle.is_loaded(&descriptor.name) {
                    // Best-effort: the name is returned even if this fails.
                    self.lifecycle.load(&descriptor, &self.planner).await;
                }
                return Some(descriptor.name.clone());
            }
        }

        if request.domain == Domain::HighStakes || request.complexity == ComplexityBucket::High {
            let reasoner = self
                .registry
                .by_purpose(ModelPurpose::Reasoning)
                .filter(|d| self.lifecycle.is_loaded(&d.name))
                .max_by(|a, b| a.memory_cost_gb.total_cmp(&b.memory_cost_gb));
            if let Some(descriptor) = reasoner {
                debug!(model = %descriptor.name, "selection: loaded reasoning model");
                return Some(descriptor.name.clone());
            }
        }

        if request.context_size > self.long_context_threshold {
            let long_context = self
                .registry
                .all()
                .filter(|d| {
                    d.max_context_tokens >= request.context_size
                        && self.lifecycle.is_loaded(&d.name)
                })
                .max_by_key(|d| d.max_context_tokens);
            if let Some(descriptor) = long_context {
                debug!(model = %descriptor.name, "selection: long-context model");
                return Some(descriptor.name.clone());
            }
        }

        let primary = self.modes.primary_model()?;
        let descriptor = self.registry.get(&primary)?;
        debug!(model = %primary, "selection: mode primary");
        if !self.lifecycle.is_loaded(&primary) {
            self.lifecycle.load(&descriptor, &self.planner).await;
        }
        Some(primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;
    use crate::modes::ModeDefinition;
    use crate::publish::EventSink;
    use crate::registry::{BackendKind, ModelDescriptor};
    use crate::resources::ResourceTracker;
    use crate::state::build_state_map;
    use crate::testing::{StaticProbe, StubBackend};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn descriptor(
        name: &str,
        purpose: ModelPurpose,
        gb: f64,
        max_context: u32,
    ) -> ModelDescriptor {
        ModelDescriptor::builder()
            .name(name.to_string())
            .backend(BackendKind::LocalRuntime)
            .purpose(purpose)
            .memory_cost_gb(gb)
            .max_context_tokens(max_context)
            .endpoint("http://localhost:11434".parse().unwrap())
            .build()
    }

    struct Fixture {
        heuristic: SelectionHeuristic,
        lifecycle: Arc<LifecycleController>,
        planner: Arc<EvictionPlanner>,
        registry: Arc<ModelRegistry>,
        backend: Arc<StubBackend>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ModelRegistry::new(vec![
            descriptor("chat", ModelPurpose::Chat, 4.0, 8192),
            descriptor("coder", ModelPurpose::Coding, 6.0, 16384),
            descriptor("reasoner-small", ModelPurpose::Reasoning, 8.0, 32768),
            descriptor("reasoner-large", ModelPurpose::Reasoning, 14.0, 32768),
            descriptor("long-context", ModelPurpose::Chat, 6.0, 131072),
        ]));
        let states = build_state_map(registry.names());
        let backend = Arc::new(StubBackend::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&states),
            Arc::clone(&backend) as Arc<dyn InferenceBackend>,
            EventSink::from_raw(tx),
        ));
        let resources = Arc::new(ResourceTracker::new(
            Arc::new(StaticProbe::new(0.0)),
            64.0,
            1.0,
            Duration::from_secs(60),
        ));
        let planner = Arc::new(EvictionPlanner::new(
            Arc::clone(&lifecycle),
            resources,
            Arc::clone(&registry),
            states,
        ));
        let modes = Arc::new(ModeManager::new(
            HashMap::from([(
                "standard".to_string(),
                ModeDefinition {
                    models: vec!["chat".to_string()],
                    solo: false,
                    primary: None,
                },
            )]),
            "standard".to_string(),
            Arc::clone(&lifecycle),
            Arc::clone(&planner),
            Arc::clone(&registry),
        ));
        let heuristic = SelectionHeuristic::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            Arc::clone(&planner),
            modes,
            16384,
        );
        Fixture {
            heuristic,
            lifecycle,
            planner,
            registry,
            backend,
        }
    }

    fn request(
        request_type: RequestKind,
        complexity: ComplexityBucket,
        domain: Domain,
        context_size: u32,
    ) -> SelectionRequest {
        SelectionRequest {
            request_type,
            complexity,
            domain,
            context_size,
        }
    }

    #[tokio::test]
    async fn code_requests_pick_and_load_the_coder() {
        let fx = fixture();
        let chosen = fx
            .heuristic
            .select(&request(
                RequestKind::Code,
                ComplexityBucket::Low,
                Domain::General,
                512,
            ))
            .await;
        assert_eq!(chosen.as_deref(), Some("coder"));
        assert_eq!(fx.backend.warm_calls("coder"), 1);
    }

    #[tokio::test]
    async fn code_selection_is_best_effort_when_load_fails() {
        let fx = fixture();
        fx.backend.fail_warm("coder");
        let chosen = fx
            .heuristic
            .select(&request(
                RequestKind::Code,
                ComplexityBucket::Low,
                Domain::General,
                512,
            ))
            .await;
        // The name still comes back; the caller re-checks status.
        assert_eq!(chosen.as_deref(), Some("coder"));
        assert!(!fx.lifecycle.is_loaded("coder"));
    }

    #[tokio::test]
    async fn high_stakes_prefers_largest_loaded_reasoner() {
        let fx = fixture();
        for name in ["reasoner-small", "reasoner-large"] {
            let desc = fx.registry.get(name).unwrap();
            assert!(fx.lifecycle.load(&desc, &fx.planner).await);
        }

        let chosen = fx
            .heuristic
            .select(&request(
                RequestKind::Chat,
                ComplexityBucket::Medium,
                Domain::HighStakes,
                512,
            ))
            .await;
        assert_eq!(chosen.as_deref(), Some("reasoner-large"));
    }

    #[tokio::test]
    async fn cold_reasoners_fall_through_to_primary() {
        let fx = fixture();
        let chosen = fx
            .heuristic
            .select(&request(
                RequestKind::Chat,
                ComplexityBucket::High,
                Domain::General,
                512,
            ))
            .await;
        // No reasoning model is loaded, so rule 2 does not fire.
        assert_eq!(chosen.as_deref(), Some("chat"));
    }

    #[tokio::test]
    async fn oversized_context_prefers_loaded_long_context_model() {
        let fx = fixture();
        let desc = fx.registry.get("long-context").unwrap();
        assert!(fx.lifecycle.load(&desc, &fx.planner).await);

        let chosen = fx
            .heuristic
            .select(&request(
                RequestKind::Chat,
                ComplexityBucket::Low,
                Domain::General,
                100_000,
            ))
            .await;
        assert_eq!(chosen.as_deref(), Some("long-context"));
    }

    #[tokio::test]
    async fn default_falls_back_to_mode_primary_and_loads_it() {
        let fx = fixture();
        let chosen = fx
            .heuristic
            .select(&request(
                RequestKind::Chat,
                ComplexityBucket::Low,
                Domain::General,
                512,
            ))
            .await;
        assert_eq!(chosen.as_deref(), Some("chat"));
        assert_eq!(fx.backend.warm_calls("chat"), 1);
    }
}
