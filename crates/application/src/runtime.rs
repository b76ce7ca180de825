use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stepwise_core::{backoff::BackoffPolicy, duration::parse_duration, AppError, AppResult, NamespaceId};
use stepwise_domain::{SerializedError, SleepContext, StepAttempt, StepKind};
use tokio::sync::Mutex;

use crate::ports::Backend;
use crate::step_cache::StepCache;

/// Outcome of one run execution that is not an ordinary successful return.
///
/// Propagated with `?` through `Result<Value, WorkflowSignal>` exactly like
/// an error, but the worker driver distinguishes the three variants
/// explicitly: `Suspended`/`LeaseLost` are never presented to
/// `Handle::result()`.
#[derive(Debug, Clone)]
pub enum WorkflowSignal {
    /// A `step.sleep` call ended this invocation; the run is not terminal.
    Suspended,
    /// The worker no longer holds the lease on this run; abandon silently.
    LeaseLost,
    /// The workflow procedure (or a step within it) failed.
    Failed(SerializedError),
}

impl WorkflowSignal {
    fn from_backend_error(error: AppError) -> Self {
        match error {
            AppError::LeaseLost(_) => Self::LeaseLost,
            other => Self::Failed(SerializedError::from(&other)),
        }
    }

    fn determinism_violation(message: impl Into<String>) -> Self {
        Self::Failed(SerializedError::from(&AppError::DeterminismViolation(
            message.into(),
        )))
    }
}

/// Future returned by a registered workflow procedure.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<Value, WorkflowSignal>> + Send>>;

/// A registered workflow procedure: `async (ctx) -> output`.
pub type WorkflowProcedure = Arc<dyn Fn(WorkflowContext) -> StepFuture + Send + Sync>;

/// A named, registered workflow: a procedure plus its retry policy.
///
/// The baseline execution path does not perform automatic per-step retries
/// (see `BackoffPolicy`'s doc comment); the policy is carried here so it is
/// available to the forward-compatible extension point without being wired
/// into `step.run` itself.
#[derive(Clone)]
pub struct WorkflowDefinition {
    name: String,
    procedure: WorkflowProcedure,
    backoff_policy: BackoffPolicy,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, procedure: WorkflowProcedure) -> Self {
        Self {
            name: name.into(),
            procedure,
            backoff_policy: BackoffPolicy::default_policy(),
        }
    }

    #[must_use]
    pub fn with_backoff_policy(mut self, backoff_policy: BackoffPolicy) -> Self {
        self.backoff_policy = backoff_policy;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff_policy
    }

    pub(crate) fn procedure(&self) -> WorkflowProcedure {
        Arc::clone(&self.procedure)
    }
}

struct ContextInner {
    namespace_id: NamespaceId,
    run_id: String,
    worker_id: String,
    input: Value,
    backend: Arc<dyn Backend>,
    cache: Mutex<StepCache>,
    attempts_by_name: HashMap<String, StepAttempt>,
    seen_step_names: Mutex<std::collections::HashSet<String>>,
    reentrancy: Mutex<()>,
}

/// Per-execution context handed to a workflow procedure: the run's input,
/// plus the `step` facade (`step.run`/`step.sleep`).
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub(crate) fn new(
        namespace_id: NamespaceId,
        run_id: String,
        worker_id: String,
        input: Value,
        backend: Arc<dyn Backend>,
        attempts: Vec<StepAttempt>,
    ) -> Self {
        let cache = StepCache::from_attempts(attempts.clone());

        let mut attempts_by_name: HashMap<String, StepAttempt> = HashMap::new();
        for attempt in attempts {
            let replace = attempts_by_name
                .get(attempt.step_name())
                .is_none_or(|existing| attempt.attempt_number() >= existing.attempt_number());
            if replace {
                attempts_by_name.insert(attempt.step_name().to_owned(), attempt);
            }
        }

        Self {
            inner: Arc::new(ContextInner {
                namespace_id,
                run_id,
                worker_id,
                input,
                backend,
                cache: Mutex::new(cache),
                attempts_by_name,
                seen_step_names: Mutex::new(std::collections::HashSet::new()),
                reentrancy: Mutex::new(()),
            }),
        }
    }

    /// The JSON input this run was enqueued with.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.inner.input
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// The `step` facade: `step.run` and `step.sleep`.
    #[must_use]
    pub fn step(&self) -> Step {
        Step {
            inner: Arc::clone(&self.inner),
        }
    }

}

async fn mark_step_name_used(inner: &ContextInner, name: &str) -> Result<(), WorkflowSignal> {
    let mut seen = inner.seen_step_names.lock().await;
    if !seen.insert(name.to_owned()) {
        return Err(WorkflowSignal::determinism_violation(format!(
            "step name '{name}' used more than once in this execution"
        )));
    }
    Ok(())
}

/// The `step` facade: memoised function calls and durable sleeps.
pub struct Step {
    inner: Arc<ContextInner>,
}

impl Step {
    /// Returns the memoised result of `fn`, invoking it only on first
    /// execution of this step name. `fn` must flow all non-determinism
    /// (time, randomness, I/O) through its own closure body; nothing
    /// outside `step.run` is replayed.
    pub async fn run<F, Fut, T>(&self, name: &str, f: F) -> Result<T, WorkflowSignal>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
        T: Serialize + DeserializeOwned,
    {
        let _reentrancy = self.inner.reentrancy.try_lock().map_err(|_| {
            WorkflowSignal::determinism_violation(format!(
                "overlapping step call while '{name}' was in flight"
            ))
        })?;

        mark_step_name_used(&self.inner, name).await?;

        if let Some(attempt) = self.inner.cache.lock().await.get(name).cloned() {
            let output = attempt.output().cloned().unwrap_or(Value::Null);
            return serde_json::from_value(output).map_err(|error| {
                WorkflowSignal::Failed(SerializedError::new(
                    "DeserializationError",
                    error.to_string(),
                ))
            });
        }

        let attempt_id = self
            .inner
            .backend
            .start_step_attempt(
                self.inner.namespace_id,
                &self.inner.run_id,
                &self.inner.worker_id,
                name,
                StepKind::Function,
                Value::Null,
                Value::Null,
            )
            .await
            .map_err(WorkflowSignal::from_backend_error)?;

        match f().await {
            Ok(value) => {
                let output = serde_json::to_value(&value).map_err(|error| {
                    WorkflowSignal::Failed(SerializedError::new(
                        "SerializationError",
                        error.to_string(),
                    ))
                })?;

                self.inner
                    .backend
                    .complete_step_attempt(
                        self.inner.namespace_id,
                        &attempt_id,
                        &self.inner.worker_id,
                        output.clone(),
                    )
                    .await
                    .map_err(WorkflowSignal::from_backend_error)?;

                let mut completed_attempt = StepAttempt::start(
                    self.inner.namespace_id,
                    attempt_id,
                    self.inner.run_id.clone(),
                    name,
                    1,
                    StepKind::Function,
                    Value::Null,
                    Utc::now(),
                )
                .map_err(|error| WorkflowSignal::Failed(SerializedError::from(&error)))?;
                completed_attempt
                    .complete(output, Utc::now())
                    .map_err(|error| WorkflowSignal::Failed(SerializedError::from(&error)))?;

                let mut cache = self.inner.cache.lock().await;
                *cache = cache.inserted(completed_attempt);

                Ok(value)
            }
            Err(error) => {
                let serialized = SerializedError::from(&error);
                self.inner
                    .backend
                    .fail_step_attempt(
                        self.inner.namespace_id,
                        &attempt_id,
                        &self.inner.worker_id,
                        serialized.to_value(),
                    )
                    .await
                    .map_err(WorkflowSignal::from_backend_error)?;

                Err(WorkflowSignal::Failed(serialized))
            }
        }
    }

    /// Suspends the run for `duration` (a `DurationString`), memoised by
    /// `name`. The first call for a given name ends this invocation with
    /// `WorkflowSignal::Suspended`; a later claim that replays past an
    /// already-elapsed sleep completes it in place and returns normally.
    pub async fn sleep(&self, name: &str, duration: &str) -> Result<(), WorkflowSignal> {
        let _reentrancy = self.inner.reentrancy.try_lock().map_err(|_| {
            WorkflowSignal::determinism_violation(format!(
                "overlapping step call while '{name}' was in flight"
            ))
        })?;

        mark_step_name_used(&self.inner, name).await?;

        if self.inner.cache.lock().await.get(name).is_some() {
            return Ok(());
        }

        if let Some(existing) = self.inner.attempts_by_name.get(name).cloned() {
            if existing.kind() != StepKind::Sleep {
                return Err(WorkflowSignal::determinism_violation(format!(
                    "step '{name}' was previously used as a function step"
                )));
            }

            self.inner
                .backend
                .complete_step_attempt(
                    self.inner.namespace_id,
                    existing.attempt_id(),
                    &self.inner.worker_id,
                    Value::Null,
                )
                .await
                .map_err(WorkflowSignal::from_backend_error)?;

            let mut completed = existing;
            completed
                .complete(Value::Null, Utc::now())
                .map_err(|error| WorkflowSignal::Failed(SerializedError::from(&error)))?;

            let mut cache = self.inner.cache.lock().await;
            *cache = cache.inserted(completed);

            return Ok(());
        }

        let delay_ms = parse_duration(duration)
            .map_err(|error| WorkflowSignal::Failed(SerializedError::from(&error)))?;
        let resume_at = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
        let context = serde_json::to_value(SleepContext { resume_at })
            .map_err(|error| WorkflowSignal::Failed(SerializedError::new("SerializationError", error.to_string())))?;

        self.inner
            .backend
            .start_step_attempt(
                self.inner.namespace_id,
                &self.inner.run_id,
                &self.inner.worker_id,
                name,
                StepKind::Sleep,
                Value::Null,
                context,
            )
            .await
            .map_err(WorkflowSignal::from_backend_error)?;

        Err(WorkflowSignal::Suspended)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::{json, Value};
    use stepwise_core::NamespaceId;

    use crate::testing::FakeBackend;

    use super::{WorkflowContext, WorkflowSignal};

    #[tokio::test]
    async fn step_run_memoises_across_contexts_sharing_a_backend() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();
        let run_id = backend
            .enqueue_run(namespace_id, "counter", json!({}), None)
            .await
            .expect("enqueue");
        let claim = backend
            .claim_run(namespace_id, "worker-1", 30_000)
            .await
            .expect("claim call")
            .expect("claimable");

        let counter = Arc::new(AtomicUsize::new(0));

        let ctx = WorkflowContext::new(
            namespace_id,
            run_id.clone(),
            "worker-1".to_owned(),
            json!({}),
            Arc::clone(&backend),
            claim.attempts,
        );

        let counter_clone = Arc::clone(&counter);
        let value: Value = ctx
            .step()
            .run("x", || async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            })
            .await
            .expect("first execution succeeds");
        assert_eq!(value, json!(1));

        let attempts = backend
            .list_attempts(namespace_id, &run_id)
            .await
            .expect("list attempts");

        let replay_ctx = WorkflowContext::new(
            namespace_id,
            run_id,
            "worker-1".to_owned(),
            json!({}),
            backend,
            attempts,
        );

        let counter_clone = Arc::clone(&counter);
        let replayed: Value = replay_ctx
            .step()
            .run("x", || async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(json!(99))
            })
            .await
            .expect("replay succeeds from cache");

        assert_eq!(replayed, json!(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_step_name_is_a_determinism_violation() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();
        let run_id = backend
            .enqueue_run(namespace_id, "dup", json!({}), None)
            .await
            .expect("enqueue");
        let claim = backend
            .claim_run(namespace_id, "worker-1", 30_000)
            .await
            .expect("claim call")
            .expect("claimable");

        let ctx = WorkflowContext::new(
            namespace_id,
            run_id,
            "worker-1".to_owned(),
            json!({}),
            backend,
            claim.attempts,
        );

        let step = ctx.step();
        let _first: Value = step.run("a", || async { Ok(json!(1)) }).await.expect("ok");
        let second = step.run::<_, _, Value>("a", || async { Ok(json!(2)) }).await;

        assert!(matches!(second, Err(WorkflowSignal::Failed(_))));
    }
}
