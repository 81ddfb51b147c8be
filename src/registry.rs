//! The static model catalog.
//!
//! Descriptors are built once at startup from the catalog file and never
//! change afterwards. All runtime state lives elsewhere (see [`crate::state`]);
//! the registry only answers "what models exist and what do they cost".

use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// How a model is served, which determines what the lifecycle controller is
/// allowed to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A locally managed inference runtime. Loadable and stoppable.
    LocalRuntime,
    /// An externally supervised, fixed-capacity container service. The
    /// controller can probe it but never stop it.
    AcceleratedContainer,
}

/// What a model is for. Drives selection and eviction protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPurpose {
    Chat,
    Reasoning,
    Coding,
    Embedding,
}

/// Coarse complexity bucket used to key latency estimates and to describe
/// incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityBucket {
    Low,
    Medium,
    High,
}

/// Immutable description of a single model.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct ModelDescriptor {
    /// Unique key for the model across the whole orchestrator.
    pub name: String,
    pub backend: BackendKind,
    pub purpose: ModelPurpose,
    /// Accelerator memory the model occupies when resident.
    pub memory_cost_gb: f64,
    pub max_context_tokens: u32,
    /// Base URL of the serving endpoint.
    pub endpoint: Url,
    /// Expected latency in milliseconds, keyed by complexity bucket.
    #[builder(default)]
    #[serde(default)]
    pub latency_estimates_ms: HashMap<ComplexityBucket, f64>,
}

/// The catalog of all registered models. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    // Insertion order preserved so enumeration is deterministic.
    ordered: Vec<Arc<ModelDescriptor>>,
    by_name: HashMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    /// Build a registry from descriptors. A duplicate name keeps the first
    /// occurrence and logs the collision.
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Self {
        let mut ordered = Vec::with_capacity(descriptors.len());
        let mut by_name = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            if by_name.contains_key(&descriptor.name) {
                tracing::warn!(model = %descriptor.name, "duplicate model name in catalog, ignoring");
                continue;
            }
            let descriptor = Arc::new(descriptor);
            by_name.insert(descriptor.name.clone(), Arc::clone(&descriptor));
            ordered.push(descriptor);
        }

        Self { ordered, by_name }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All descriptors in catalog order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.ordered.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.ordered.iter().map(|d| d.name.clone()).collect()
    }

    /// Descriptors with the given purpose, in catalog order.
    pub fn by_purpose(&self, purpose: ModelPurpose) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.ordered.iter().filter(move |d| d.purpose == purpose)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
