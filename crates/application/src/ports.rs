use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_core::{AppResult, NamespaceId};
use stepwise_domain::{StepAttempt, StepKind, WorkflowRun};

/// A run handed back by a successful `claim_run`, with its full attempt
/// history already attached so the caller can build a step cache without a
/// second round trip.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub attempts: Vec<StepAttempt>,
}

/// Outcome of a `heartbeat` call: either the lease was extended, or it has
/// already been stolen (or the run is terminal) and the caller must abandon
/// its in-flight execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Extended,
    Lost,
}

/// The transactional storage contract every backend implements.
///
/// All methods take `namespace_id` so a single backend instance can serve
/// many tenants. Lease-not-held conditions on step/run transitions surface
/// as `Err(AppError::LeaseLost)`, which callers must treat as a silent
/// abandon signal rather than a hard failure.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts a new `pending` run with a fresh id. Atomic.
    async fn enqueue_run(
        &self,
        namespace_id: NamespaceId,
        workflow_name: &str,
        input: Value,
        parent_run_id: Option<String>,
    ) -> AppResult<String>;

    /// Atomically claims one runnable run, or returns `None` if none is
    /// runnable. See the runnable-ordering contract: FIFO by `created_at`
    /// with `run_id` as tiebreak, skipping runs with an active sleep whose
    /// `resume_at` is still in the future.
    async fn claim_run(
        &self,
        namespace_id: NamespaceId,
        worker_id: &str,
        lease_duration_ms: u64,
    ) -> AppResult<Option<ClaimedRun>>;

    /// Extends the lease iff still held by `worker_id` and not expired.
    async fn heartbeat(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        lease_duration_ms: u64,
    ) -> AppResult<HeartbeatOutcome>;

    /// Clears the lease and returns the run to `pending`. Used on graceful
    /// shutdown and on a sleep yield.
    async fn release_run(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
    ) -> AppResult<()>;

    /// Reads a run's current record, or `None` if it does not exist. Backs
    /// `Handle::result()`'s terminal-status polling without reusing
    /// `claim_run`'s side effects.
    async fn get_run(&self, namespace_id: NamespaceId, run_id: &str) -> AppResult<Option<WorkflowRun>>;

    /// Returns all attempts for a run, ordered by `(step_name,
    /// attempt_number)`.
    async fn list_attempts(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
    ) -> AppResult<Vec<StepAttempt>>;

    /// Appends a `running` attempt. Fails with `Conflict` if a `completed`
    /// attempt already exists for `(run_id, step_name)`, and with
    /// `LeaseLost` if the lease is not held.
    async fn start_step_attempt(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        step_name: &str,
        kind: StepKind,
        config: Value,
        context: Value,
    ) -> AppResult<String>;

    /// Transitions `running -> completed`. Fails with `LeaseLost` if the
    /// lease is not held.
    async fn complete_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        output: Value,
    ) -> AppResult<()>;

    /// Transitions `running -> failed`. Fails with `LeaseLost` if the lease
    /// is not held.
    async fn fail_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        error: Value,
    ) -> AppResult<()>;

    /// Terminal transition to `completed`. Fails with `LeaseLost` if the
    /// lease is not held.
    async fn mark_run_succeeded(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        output: Value,
    ) -> AppResult<()>;

    /// Terminal transition to `failed`. Fails with `LeaseLost` if the lease
    /// is not held.
    async fn mark_run_failed(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        error: Value,
    ) -> AppResult<()>;

    /// Finds runs whose `lease_expires_at <= now` and status `running`, and
    /// returns them to `pending` with `worker_id = null`. Returns the count
    /// reclaimed.
    async fn sweep_expired_leases(
        &self,
        namespace_id: NamespaceId,
        now: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Blocks (or long-polls) until new runnable work may be available,
    /// returning an opaque cursor greater than `since_token`. The contract
    /// is only the wakeup; callers must still re-attempt `claim_run` and
    /// treat a timeout as "no new information".
    async fn wait_for_change(
        &self,
        namespace_id: NamespaceId,
        since_token: u64,
        timeout: std::time::Duration,
    ) -> AppResult<u64>;
}
