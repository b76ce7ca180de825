use std::collections::HashMap;
use std::sync::Arc;

use stepwise_domain::{StepAttempt, StepAttemptStatus};

/// Immutable, per-run map from step name to its completed attempt.
///
/// Consulted before re-executing any step; a hit means `fn` must not run
/// again. Updates are functional: `inserted` returns a new cache, leaving
/// the receiver untouched. This is safe without synchronisation because a
/// single run is always driven by exactly one in-flight execution at a
/// time (see the reentrancy guard in the runtime).
#[derive(Debug, Clone, Default)]
pub struct StepCache {
    completed: Arc<HashMap<String, StepAttempt>>,
}

impl StepCache {
    /// Builds a cache from a run's full attempt history, keeping only
    /// attempts whose status is `Completed` (the legacy `succeeded` spelling
    /// is already normalised to `Completed` by the domain layer on read).
    #[must_use]
    pub fn from_attempts(attempts: Vec<StepAttempt>) -> Self {
        let completed = attempts
            .into_iter()
            .filter(|attempt| attempt.status() == StepAttemptStatus::Completed)
            .map(|attempt| (attempt.step_name().to_owned(), attempt))
            .collect();

        Self {
            completed: Arc::new(completed),
        }
    }

    /// Looks up a completed attempt by step name.
    #[must_use]
    pub fn get(&self, step_name: &str) -> Option<&StepAttempt> {
        self.completed.get(step_name)
    }

    /// Returns a new cache with `attempt` added, keyed by its step name.
    #[must_use]
    pub fn inserted(&self, attempt: StepAttempt) -> Self {
        let mut completed = (*self.completed).clone();
        completed.insert(attempt.step_name().to_owned(), attempt);
        Self {
            completed: Arc::new(completed),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use stepwise_core::NamespaceId;
    use stepwise_domain::{StepAttempt, StepKind};

    use super::StepCache;

    fn completed_attempt(step_name: &str) -> StepAttempt {
        let mut attempt = StepAttempt::start(
            NamespaceId::new(),
            format!("attempt-{step_name}"),
            "run-1",
            step_name,
            1,
            StepKind::Function,
            json!({}),
            Utc::now(),
        )
        .expect("valid attempt");
        attempt
            .complete(json!({ "value": 1 }), Utc::now())
            .expect("valid transition");
        attempt
    }

    #[test]
    fn running_attempts_are_not_cached() {
        let running = StepAttempt::start(
            NamespaceId::new(),
            "attempt-1",
            "run-1",
            "a",
            1,
            StepKind::Function,
            json!({}),
            Utc::now(),
        )
        .expect("valid attempt");

        let cache = StepCache::from_attempts(vec![running]);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn inserted_leaves_the_original_cache_untouched() {
        let original = StepCache::from_attempts(vec![completed_attempt("a")]);
        let updated = original.inserted(completed_attempt("b"));

        assert!(original.get("b").is_none());
        assert!(updated.get("a").is_some());
        assert!(updated.get("b").is_some());
    }
}
