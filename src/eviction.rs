//! Eviction planning.
//!
//! When a load request does not fit the remaining budget, the planner scores
//! every resident model and unloads the cheapest-to-lose ones until enough
//! memory is freed. Scoring (lower evicts first):
//!
//! - +1000 for embedding-purpose models while `preserve_embeddings` is set
//! - +500 for models with in-flight requests
//! - a recency bonus of max(0, 100 − minutes since last use)
//!
//! Equal scores evict the smaller model first, minimizing the number of
//! evictions for a given need. That tie-break is a policy choice, not a hard
//! requirement, and is safe to adjust.

use crate::lifecycle::LifecycleController;
use crate::registry::{ModelDescriptor, ModelPurpose, ModelRegistry};
use crate::resources::ResourceTracker;
use crate::state::{ModelRuntime, ModelStatus, StateMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct EvictionPlanner {
    lifecycle: Arc<LifecycleController>,
    resources: Arc<ResourceTracker>,
    registry: Arc<ModelRegistry>,
    states: StateMap,
}

struct Candidate {
    descriptor: Arc<ModelDescriptor>,
    score: i64,
}

impl EvictionPlanner {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        resources: Arc<ResourceTracker>,
        registry: Arc<ModelRegistry>,
        states: StateMap,
    ) -> Self {
        Self {
            lifecycle,
            resources,
            registry,
            states,
        }
    }

    /// Make at least `required_gb` of budget available, evicting resident
    /// models if necessary. Returns whether the request can be satisfied.
    pub async fn ensure_available(&self, required_gb: f64, preserve_embeddings: bool) -> bool {
        let available = self.resources.available_gb().await;
        if available >= required_gb {
            return true;
        }

        let need = required_gb - available;
        debug!(
            required_gb,
            available_gb = available,
            need_gb = need,
            "budget short, planning eviction"
        );
        self.smart_unload(need, preserve_embeddings).await
    }

    /// Evict lowest-priority resident models until `need_gb` has been freed.
    async fn smart_unload(&self, need_gb: f64, preserve_embeddings: bool) -> bool {
        let mut candidates: Vec<Candidate> = self
            .registry
            .all()
            .filter_map(|descriptor| {
                let entry = self.states.get(&descriptor.name)?;
                let runtime = entry.snapshot();
                if runtime.status != ModelStatus::Loaded {
                    return None;
                }
                Some(Candidate {
                    score: Self::score(descriptor, &runtime, preserve_embeddings),
                    descriptor: Arc::clone(descriptor),
                })
            })
            .collect();

        // Lowest priority first; smaller model first among equals.
        candidates.sort_by(|a, b| {
            a.score
                .cmp(&b.score)
                .then(a.descriptor.memory_cost_gb.total_cmp(&b.descriptor.memory_cost_gb))
        });

        let mut freed = 0.0;
        for candidate in candidates {
            if freed >= need_gb {
                break;
            }
            debug!(
                model = %candidate.descriptor.name,
                score = candidate.score,
                memory_gb = candidate.descriptor.memory_cost_gb,
                "evicting"
            );
            if self.lifecycle.unload(&candidate.descriptor).await {
                freed += candidate.descriptor.memory_cost_gb;
                info!(
                    model = %candidate.descriptor.name,
                    freed_gb = freed,
                    need_gb,
                    "evicted model"
                );
            }
        }

        if freed >= need_gb {
            self.resources.invalidate().await;
            true
        } else {
            warn!(freed_gb = freed, need_gb, "eviction could not free enough memory");
            false
        }
    }

    /// Eviction priority for one resident model. Lower scores are evicted
    /// first.
    fn score(descriptor: &ModelDescriptor, runtime: &ModelRuntime, preserve_embeddings: bool) -> i64 {
        let mut score = 0i64;
        if preserve_embeddings && descriptor.purpose == ModelPurpose::Embedding {
            score += 1000;
        }
        if runtime.active_requests > 0 {
            score += 500;
        }
        if let Some(last_used) = runtime.last_used {
            let minutes = (last_used.elapsed().as_secs() / 60) as i64;
            score += (100 - minutes).max(0);
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendKind, ModelDescriptor};
    use std::time::{Duration, Instant};

    fn descriptor(name: &str, purpose: ModelPurpose, gb: f64) -> ModelDescriptor {
        ModelDescriptor::builder()
            .name(name.to_string())
            .backend(BackendKind::LocalRuntime)
            .purpose(purpose)
            .memory_cost_gb(gb)
            .max_context_tokens(8192)
            .endpoint("http://localhost:11434".parse().unwrap())
            .build()
    }

    fn runtime(active: usize, last_used_secs_ago: u64) -> ModelRuntime {
        ModelRuntime {
            status: ModelStatus::Loaded,
            last_used: Instant::now().checked_sub(Duration::from_secs(last_used_secs_ago)),
            active_requests: active,
            ..ModelRuntime::default()
        }
    }

    #[test]
    fn embedding_models_are_protected() {
        let embed = descriptor("embed", ModelPurpose::Embedding, 2.0);
        let chat = descriptor("chat", ModelPurpose::Chat, 2.0);
        let rt = runtime(0, 30);

        assert!(
            EvictionPlanner::score(&embed, &rt, true)
                > EvictionPlanner::score(&chat, &rt, true)
        );
        assert_eq!(
            EvictionPlanner::score(&embed, &rt, false),
            EvictionPlanner::score(&chat, &rt, false)
        );
    }

    #[test]
    fn busy_models_score_above_idle_ones() {
        let chat = descriptor("chat", ModelPurpose::Chat, 2.0);
        assert!(
            EvictionPlanner::score(&chat, &runtime(1, 30), true)
                > EvictionPlanner::score(&chat, &runtime(0, 30), true)
        );
    }

    #[test]
    fn recency_bonus_decays_per_minute() {
        let chat = descriptor("chat", ModelPurpose::Chat, 2.0);

        // Used seconds ago: full bonus of 100.
        assert_eq!(EvictionPlanner::score(&chat, &runtime(0, 5), true), 100);
        // Used an hour ago: bonus of 40.
        assert_eq!(EvictionPlanner::score(&chat, &runtime(0, 3600), true), 40);
        // Bonus floors at zero, never goes negative.
        assert_eq!(EvictionPlanner::score(&chat, &runtime(0, 7200), true), 0);
        // Never used at all: no bonus.
        let never = ModelRuntime {
            status: ModelStatus::Loaded,
            ..ModelRuntime::default()
        };
        assert_eq!(EvictionPlanner::score(&chat, &never, true), 0);
    }
}
