use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_core::{AppError, AppResult, NamespaceId, NonEmptyString};

/// Lifecycle status of a workflow run.
///
/// The lattice is `Pending -> Running -> {Completed, Failed}`; there is no
/// path back out of a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    /// Created, not yet claimed by any worker.
    Pending,
    /// Claimed and currently executing (including while suspended on sleep).
    Running,
    /// Finished successfully; `output` is populated.
    Completed,
    /// Finished with an unrecoverable error; `error` is populated.
    Failed,
}

impl WorkflowRunStatus {
    /// True once the run has reached a terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

/// A single durable execution of a workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    namespace_id: NamespaceId,
    run_id: NonEmptyString,
    workflow_name: NonEmptyString,
    input: Value,
    status: WorkflowRunStatus,
    output: Option<Value>,
    error: Option<Value>,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    parent_run_id: Option<String>,
}

impl WorkflowRun {
    /// Creates a new run in `Pending` status.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace_id: NamespaceId,
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        input: Value,
        created_at: DateTime<Utc>,
        parent_run_id: Option<String>,
    ) -> AppResult<Self> {
        let run_id = NonEmptyString::new(run_id)?;
        let workflow_name = NonEmptyString::new(workflow_name)?;

        Ok(Self {
            namespace_id,
            run_id,
            workflow_name,
            input,
            status: WorkflowRunStatus::Pending,
            output: None,
            error: None,
            worker_id: None,
            lease_expires_at: None,
            created_at,
            updated_at: created_at,
            started_at: None,
            finished_at: None,
            parent_run_id,
        })
    }

    /// Reconstructs a run from backend-stored fields without re-validating
    /// the status lattice; callers fetching from storage trust the row.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        namespace_id: NamespaceId,
        run_id: NonEmptyString,
        workflow_name: NonEmptyString,
        input: Value,
        status: WorkflowRunStatus,
        output: Option<Value>,
        error: Option<Value>,
        worker_id: Option<String>,
        lease_expires_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        parent_run_id: Option<String>,
    ) -> Self {
        Self {
            namespace_id,
            run_id,
            workflow_name,
            input,
            status,
            output,
            error,
            worker_id,
            lease_expires_at,
            created_at,
            updated_at,
            started_at,
            finished_at,
            parent_run_id,
        }
    }

    #[must_use]
    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace_id
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        self.run_id.as_str()
    }

    #[must_use]
    pub fn workflow_name(&self) -> &str {
        self.workflow_name.as_str()
    }

    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    #[must_use]
    pub fn status(&self) -> WorkflowRunStatus {
        self.status
    }

    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    #[must_use]
    pub fn error(&self) -> Option<&Value> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    #[must_use]
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease_expires_at
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    #[must_use]
    pub fn parent_run_id(&self) -> Option<&str> {
        self.parent_run_id.as_deref()
    }

    /// Transitions to `Running`, recording the claiming worker and its lease.
    pub fn mark_running(
        &mut self,
        worker_id: impl Into<String>,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.transition(WorkflowRunStatus::Running, now)?;
        self.worker_id = Some(worker_id.into());
        self.lease_expires_at = Some(lease_expires_at);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// Transitions to `Completed` with the given output.
    pub fn mark_succeeded(&mut self, output: Value, now: DateTime<Utc>) -> AppResult<()> {
        self.transition(WorkflowRunStatus::Completed, now)?;
        self.output = Some(output);
        self.lease_expires_at = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Transitions to `Failed` with the given serialized error.
    pub fn mark_failed(&mut self, error: Value, now: DateTime<Utc>) -> AppResult<()> {
        self.transition(WorkflowRunStatus::Failed, now)?;
        self.error = Some(error);
        self.lease_expires_at = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Releases the lease and returns the run to a claimable state without
    /// changing its status; used when a worker suspends on `step.sleep` or
    /// loses its lease and the run must become claimable again.
    pub fn requeue(&mut self, lease_expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.lease_expires_at = lease_expires_at;
        self.updated_at = now;
    }

    fn transition(&mut self, next: WorkflowRunStatus, now: DateTime<Utc>) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::DeterminismViolation(format!(
                "invalid run status transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use stepwise_core::NamespaceId;

    use super::{WorkflowRun, WorkflowRunStatus};

    #[test]
    fn new_run_starts_pending() {
        let run = WorkflowRun::new(
            NamespaceId::new(),
            "run-1",
            "send-welcome-email",
            json!({ "userId": "u1" }),
            Utc::now(),
            None,
        )
        .expect("valid run");

        assert_eq!(run.status(), WorkflowRunStatus::Pending);
        assert!(run.started_at().is_none());
    }

    #[test]
    fn rejects_blank_run_id() {
        let result = WorkflowRun::new(
            NamespaceId::new(),
            "   ",
            "send-welcome-email",
            json!({}),
            Utc::now(),
            None,
        );

        assert!(result.is_err());
    }

    #[test]
    fn cannot_complete_a_pending_run() {
        let mut run = WorkflowRun::new(
            NamespaceId::new(),
            "run-1",
            "send-welcome-email",
            json!({}),
            Utc::now(),
            None,
        )
        .expect("valid run");

        let result = run.mark_succeeded(json!({}), Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn running_to_completed_sets_output_and_clears_lease() {
        let now = Utc::now();
        let mut run = WorkflowRun::new(
            NamespaceId::new(),
            "run-1",
            "send-welcome-email",
            json!({}),
            now,
            None,
        )
        .expect("valid run");

        run.mark_running("worker-1", now, now).expect("valid transition");
        run.mark_succeeded(json!({ "ok": true }), now)
            .expect("valid transition");

        assert_eq!(run.status(), WorkflowRunStatus::Completed);
        assert!(run.lease_expires_at().is_none());
        assert_eq!(run.output(), Some(&json!({ "ok": true })));
    }
}
