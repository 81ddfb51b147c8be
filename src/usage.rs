//! Per-model usage accounting: in-flight refcounts, recency, throughput.

use crate::state::{ModelStatus, StateMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Smoothing factor for the tokens-per-second moving average.
const EMA_SMOOTHING: f64 = 0.1;

#[derive(Clone)]
pub struct UsageTracker {
    states: StateMap,
}

impl UsageTracker {
    pub fn new(states: StateMap) -> Self {
        Self { states }
    }

    /// Mark a request as in flight on a model. Unknown names are logged and
    /// ignored; refcount mistakes must never panic the request path.
    pub fn mark_used(&self, name: &str) {
        let Some(entry) = self.states.get(name) else {
            warn!(model = %name, "mark_used on unknown model");
            return;
        };
        entry.with_runtime(|runtime| {
            runtime.active_requests += 1;
            runtime.last_used = Some(Instant::now());
        });
    }

    /// Release a previously marked request. Floors at zero so an unmatched
    /// release can never drive the count negative.
    pub fn release(&self, name: &str) {
        let Some(entry) = self.states.get(name) else {
            warn!(model = %name, "release on unknown model");
            return;
        };
        entry.with_runtime(|runtime| {
            if runtime.active_requests == 0 {
                warn!(model = %name, "release without matching mark_used");
            } else {
                runtime.active_requests -= 1;
            }
        });
    }

    /// Record a completed generation: updates the throughput moving average
    /// and the running token total. The first sample seeds the average
    /// directly so early readings are not biased toward zero.
    pub fn update_stats(&self, name: &str, tokens: u64, duration: Duration) {
        let Some(entry) = self.states.get(name) else {
            warn!(model = %name, "update_stats on unknown model");
            return;
        };
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            debug!(model = %name, "ignoring zero-duration stats sample");
            return;
        }
        let rate = tokens as f64 / secs;
        entry.with_runtime(|runtime| {
            runtime.tokens_per_second = if runtime.tokens_per_second == 0.0 {
                rate
            } else {
                EMA_SMOOTHING * rate + (1.0 - EMA_SMOOTHING) * runtime.tokens_per_second
            };
            runtime.total_tokens += tokens;
        });
    }

    pub fn active_requests(&self, name: &str) -> usize {
        self.states
            .get(name)
            .map(|e| e.snapshot().active_requests)
            .unwrap_or(0)
    }

    /// RAII variant of mark_used/release for the generation path: the count
    /// is released when the guard drops, even if the request errors out.
    pub fn begin_request(&self, name: &str) -> Option<RequestGuard> {
        let entry = self.states.get(name).map(|e| Arc::clone(e.value()))?;
        if entry.status() != ModelStatus::Loaded {
            debug!(model = %name, "begin_request on a model that is not loaded");
        }
        self.mark_used(name);
        Some(RequestGuard {
            tracker: self.clone(),
            name: name.to_string(),
        })
    }
}

pub struct RequestGuard {
    tracker: UsageTracker,
    name: String,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_state_map;

    fn tracker() -> UsageTracker {
        UsageTracker::new(build_state_map(["chat".to_string()]))
    }

    #[test]
    fn refcount_round_trip() {
        let tracker = tracker();
        tracker.mark_used("chat");
        tracker.mark_used("chat");
        assert_eq!(tracker.active_requests("chat"), 2);
        tracker.release("chat");
        assert_eq!(tracker.active_requests("chat"), 1);
    }

    #[test]
    fn release_floors_at_zero() {
        let tracker = tracker();
        tracker.release("chat");
        tracker.release("chat");
        assert_eq!(tracker.active_requests("chat"), 0);

        tracker.mark_used("chat");
        tracker.release("chat");
        tracker.release("chat");
        assert_eq!(tracker.active_requests("chat"), 0);
    }

    #[test]
    fn guard_releases_on_drop() {
        let tracker = tracker();
        {
            let _guard = tracker.begin_request("chat").unwrap();
            assert_eq!(tracker.active_requests("chat"), 1);
        }
        assert_eq!(tracker.active_requests("chat"), 0);
        assert!(tracker.begin_request("missing").is_none());
    }

    #[test]
    fn ema_seeds_then_smooths() {
        let tracker = tracker();
        let states = tracker.states.clone();

        tracker.update_stats("chat", 100, Duration::from_secs(1));
        let first = states.get("chat").unwrap().snapshot().tokens_per_second;
        assert!((first - 100.0).abs() < 1e-9);

        tracker.update_stats("chat", 200, Duration::from_secs(1));
        let second = states.get("chat").unwrap().snapshot().tokens_per_second;
        // 0.1 * 200 + 0.9 * 100
        assert!((second - 110.0).abs() < 1e-9);

        let total = states.get("chat").unwrap().snapshot().total_tokens;
        assert_eq!(total, 300);
    }

    #[test]
    fn zero_duration_samples_are_ignored() {
        let tracker = tracker();
        tracker.update_stats("chat", 100, Duration::ZERO);
        assert_eq!(
            tracker.states.get("chat").unwrap().snapshot().total_tokens,
            0
        );
    }
}
