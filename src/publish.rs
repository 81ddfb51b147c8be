//! Status fan-out.
//!
//! Lifecycle transitions are pushed onto an explicit event queue and consumed
//! by a single publisher task, which rebuilds a full status snapshot per
//! event and hands it to every subscriber. Running fan-out in one owned loop
//! (rather than fire-and-forget tasks) means a failing subscriber is logged
//! in-line and can never silently swallow an error, and never affects other
//! subscribers.

use crate::registry::{BackendKind, ModelPurpose, ModelRegistry};
use crate::resources::ResourceTracker;
use crate::state::{ModelStatus, StateMap};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Per-model slice of a status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub status: String,
    pub backend: BackendKind,
    pub purpose: ModelPurpose,
    pub memory_gb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_secs_ago: Option<u64>,
    pub tokens_per_second: f64,
    pub active_requests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    pub total_capacity_gb: f64,
    pub reserved_margin_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
}

/// Full status snapshot: every descriptor, its runtime state, and the budget.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub models: HashMap<String, ModelReport>,
    pub budget: BudgetReport,
}

/// Build a snapshot of the whole orchestrator.
pub async fn build_snapshot(
    registry: &ModelRegistry,
    states: &StateMap,
    resources: &ResourceTracker,
) -> StatusSnapshot {
    let used_gb = resources.usage_gb().await;
    let available_gb =
        resources.total_capacity_gb() - resources.reserved_margin_gb() - used_gb;

    let mut models = HashMap::with_capacity(registry.len());
    for descriptor in registry.all() {
        let Some(entry) = states.get(&descriptor.name) else {
            continue;
        };
        let runtime = entry.snapshot();
        models.insert(
            descriptor.name.clone(),
            ModelReport {
                status: runtime.status.as_str().to_string(),
                backend: descriptor.backend,
                purpose: descriptor.purpose,
                memory_gb: descriptor.memory_cost_gb,
                last_used_secs_ago: runtime.last_used.map(|at| at.elapsed().as_secs()),
                tokens_per_second: runtime.tokens_per_second,
                active_requests: runtime.active_requests,
                error_detail: runtime.error_detail,
            },
        );
    }

    StatusSnapshot {
        models,
        budget: BudgetReport {
            total_capacity_gb: resources.total_capacity_gb(),
            reserved_margin_gb: resources.reserved_margin_gb(),
            used_gb,
            available_gb,
        },
    }
}

/// One lifecycle transition, as queued for the publisher task.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub model: String,
    pub status: ModelStatus,
}

/// Cloneable handle the lifecycle controller uses to queue events.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl EventSink {
    pub(crate) fn from_raw(tx: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { tx }
    }

    pub fn model_changed(&self, model: &str, status: &ModelStatus) {
        // A closed queue only happens during shutdown; dropping the event
        // is correct there.
        let _ = self.tx.send(StatusEvent {
            model: model.to_string(),
            status: status.clone(),
        });
    }
}

pub type SubscriberId = u64;

type SubscriberFn =
    Box<dyn Fn(&StatusSnapshot) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Fans out state-change snapshots to registered subscribers.
pub struct StatusPublisher {
    subscribers: Arc<DashMap<SubscriberId, SubscriberFn>>,
    next_id: AtomicU64,
    events: EventSink,
    broadcast_tx: broadcast::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    /// Create the publisher and spawn its consumer loop. The loop exits when
    /// every [`EventSink`] clone has been dropped.
    pub fn new(
        registry: Arc<ModelRegistry>,
        states: StateMap,
        resources: Arc<ResourceTracker>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusEvent>();
        let (broadcast_tx, _) = broadcast::channel(32);
        let subscribers: Arc<DashMap<SubscriberId, SubscriberFn>> = Arc::new(DashMap::new());

        let loop_subscribers = Arc::clone(&subscribers);
        let loop_broadcast = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!(model = %event.model, status = %event.status, "publishing status change");
                let snapshot = build_snapshot(&registry, &states, &resources).await;

                // No live SSE listener is not an error.
                let _ = loop_broadcast.send(snapshot.clone());

                for subscriber in loop_subscribers.iter() {
                    if let Err(e) = (subscriber.value())(&snapshot) {
                        warn!(
                            subscriber = subscriber.key(),
                            error = %e,
                            "status subscriber failed"
                        );
                    }
                }
            }
            debug!("status publisher loop stopped");
        });

        Self {
            subscribers,
            next_id: AtomicU64::new(1),
            events: EventSink { tx },
            broadcast_tx,
        }
    }

    /// Handle handed to the lifecycle controller for queueing transitions.
    pub fn sink(&self) -> EventSink {
        self.events.clone()
    }

    /// Register a subscriber callback. Returns an id for [`Self::unsubscribe`].
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&StatusSnapshot) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, Box::new(callback));
        debug!(subscriber = id, "subscriber added");
        id
    }

    /// Remove a subscriber. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        debug!(subscriber = id, removed, "subscriber removed");
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Snapshot stream for the SSE live-status feed.
    pub fn snapshot_stream(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.broadcast_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelDescriptor;
    use crate::resources::VramProbe;
    use crate::state::build_state_map;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoProbe;

    #[async_trait]
    impl VramProbe for NoProbe {
        async fn used_gb(&self) -> Option<f64> {
            None
        }
    }

    fn publisher() -> StatusPublisher {
        let registry = Arc::new(ModelRegistry::new(vec![
            ModelDescriptor::builder()
                .name("chat".to_string())
                .backend(BackendKind::LocalRuntime)
                .purpose(ModelPurpose::Chat)
                .memory_cost_gb(4.0)
                .max_context_tokens(8192)
                .endpoint("http://localhost:11434".parse().unwrap())
                .build(),
        ]));
        let states = build_state_map(registry.names());
        let resources = Arc::new(ResourceTracker::new(
            Arc::new(NoProbe),
            24.0,
            1.0,
            Duration::from_secs(5),
        ));
        StatusPublisher::new(registry, states, resources)
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_starve_others() {
        let publisher = publisher();
        let (tx, mut rx) = mpsc::unbounded_channel();

        publisher.subscribe(|_| Err("subscriber exploded".into()));
        publisher.subscribe(move |snapshot| {
            tx.send(snapshot.models.len()).unwrap();
            Ok(())
        });

        publisher
            .sink()
            .model_changed("chat", &ModelStatus::Loading);

        let model_count = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second subscriber should still be invoked")
            .unwrap();
        assert_eq!(model_count, 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let publisher = publisher();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = publisher.subscribe(move |_| {
            tx.send(()).unwrap();
            Ok(())
        });
        assert_eq!(publisher.subscriber_count(), 1);
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));

        publisher.sink().model_changed("chat", &ModelStatus::Loading);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
