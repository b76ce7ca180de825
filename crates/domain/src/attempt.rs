use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_core::{AppError, AppResult, NamespaceId, NonEmptyString};

/// What a step attempt represents: a user function call, or a sleep
/// checkpoint waiting for a wall-clock deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A `step.run(name, fn)` call.
    Function,
    /// A `step.sleep(name, duration)` call.
    Sleep,
}

/// Lifecycle status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAttemptStatus {
    /// In progress (function executing, or sleep pending its deadline).
    Running,
    /// Finished successfully; `output` is populated.
    Completed,
    /// Finished with an error; `error` is populated.
    Failed,
}

impl StepAttemptStatus {
    /// Parses the legacy `"succeeded"` spelling as equivalent to `Completed`;
    /// older rows written before the vocabulary settled use it.
    #[must_use]
    pub fn parse_legacy(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" | "succeeded" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Payload of a `Sleep`-kind step's `context` field: the resolved wake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SleepContext {
    /// The instant the sleep resolves at; recomputed once on first execution
    /// and memoised thereafter so replay never re-derives it from `now()`.
    pub resume_at: DateTime<Utc>,
}

/// A single attempt at a named step within a workflow run.
#[derive(Debug, Clone)]
pub struct StepAttempt {
    namespace_id: NamespaceId,
    attempt_id: NonEmptyString,
    workflow_run_id: NonEmptyString,
    step_name: NonEmptyString,
    attempt_number: u32,
    kind: StepKind,
    status: StepAttemptStatus,
    config: Value,
    context: Value,
    output: Option<Value>,
    error: Option<Value>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    child_workflow_run_id: Option<String>,
}

impl StepAttempt {
    /// Starts a new attempt for `step_name`. `attempt_number` is 1-based and
    /// must be at least 1 — attempt numbering begins at first execution, not
    /// at queue time.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        namespace_id: NamespaceId,
        attempt_id: impl Into<String>,
        workflow_run_id: impl Into<String>,
        step_name: impl Into<String>,
        attempt_number: u32,
        kind: StepKind,
        config: Value,
        now: DateTime<Utc>,
    ) -> AppResult<Self> {
        if attempt_number < 1 {
            return Err(AppError::Validation(
                "attempt_number must be >= 1".to_owned(),
            ));
        }

        Ok(Self {
            namespace_id,
            attempt_id: NonEmptyString::new(attempt_id)?,
            workflow_run_id: NonEmptyString::new(workflow_run_id)?,
            step_name: NonEmptyString::new(step_name)?,
            attempt_number,
            kind,
            status: StepAttemptStatus::Running,
            config,
            context: Value::Null,
            output: None,
            error: None,
            started_at: now,
            finished_at: None,
            created_at: now,
            updated_at: now,
            child_workflow_run_id: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        namespace_id: NamespaceId,
        attempt_id: NonEmptyString,
        workflow_run_id: NonEmptyString,
        step_name: NonEmptyString,
        attempt_number: u32,
        kind: StepKind,
        status: StepAttemptStatus,
        config: Value,
        context: Value,
        output: Option<Value>,
        error: Option<Value>,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        child_workflow_run_id: Option<String>,
    ) -> Self {
        Self {
            namespace_id,
            attempt_id,
            workflow_run_id,
            step_name,
            attempt_number,
            kind,
            status,
            config,
            context,
            output,
            error,
            started_at,
            finished_at,
            created_at,
            updated_at,
            child_workflow_run_id,
        }
    }

    #[must_use]
    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace_id
    }

    #[must_use]
    pub fn attempt_id(&self) -> &str {
        self.attempt_id.as_str()
    }

    #[must_use]
    pub fn workflow_run_id(&self) -> &str {
        self.workflow_run_id.as_str()
    }

    #[must_use]
    pub fn step_name(&self) -> &str {
        self.step_name.as_str()
    }

    #[must_use]
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    #[must_use]
    pub fn kind(&self) -> StepKind {
        self.kind
    }

    #[must_use]
    pub fn status(&self) -> StepAttemptStatus {
        self.status
    }

    #[must_use]
    pub fn config(&self) -> &Value {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> &Value {
        &self.context
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
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    #[must_use]
    pub fn child_workflow_run_id(&self) -> Option<&str> {
        self.child_workflow_run_id.as_deref()
    }

    /// Records the resolved wake time for a `Sleep` attempt. Valid only
    /// while the attempt is still `Running`.
    pub fn set_sleep_context(&mut self, sleep: SleepContext, now: DateTime<Utc>) -> AppResult<()> {
        if self.kind != StepKind::Sleep {
            return Err(AppError::DeterminismViolation(
                "set_sleep_context called on a non-sleep step".to_owned(),
            ));
        }
        if self.status != StepAttemptStatus::Running {
            return Err(AppError::DeterminismViolation(
                "cannot set sleep context on a finished attempt".to_owned(),
            ));
        }

        self.context = serde_json::to_value(sleep)
            .map_err(|error| AppError::Internal(error.to_string()))?;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the attempt completed with `output`.
    pub fn complete(&mut self, output: Value, now: DateTime<Utc>) -> AppResult<()> {
        self.transition(StepAttemptStatus::Completed, now)?;
        self.output = Some(output);
        Ok(())
    }

    /// Marks the attempt failed with a serialized error.
    pub fn fail(&mut self, error: Value, now: DateTime<Utc>) -> AppResult<()> {
        self.transition(StepAttemptStatus::Failed, now)?;
        self.error = Some(error);
        Ok(())
    }

    fn transition(&mut self, next: StepAttemptStatus, now: DateTime<Utc>) -> AppResult<()> {
        if self.status != StepAttemptStatus::Running {
            return Err(AppError::DeterminismViolation(format!(
                "step attempt already finished with status {:?}",
                self.status
            )));
        }
        self.status = next;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use stepwise_core::NamespaceId;

    use super::{StepAttempt, StepAttemptStatus, StepKind};

    #[test]
    fn rejects_zero_attempt_number() {
        let result = StepAttempt::start(
            NamespaceId::new(),
            "attempt-1",
            "run-1",
            "charge-card",
            0,
            StepKind::Function,
            json!({}),
            Utc::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn completing_twice_is_a_determinism_violation() {
        let mut attempt = StepAttempt::start(
            NamespaceId::new(),
            "attempt-1",
            "run-1",
            "charge-card",
            1,
            StepKind::Function,
            json!({}),
            Utc::now(),
        )
        .expect("valid attempt");

        attempt.complete(json!({ "ok": true }), Utc::now()).expect("first complete");
        assert!(attempt.complete(json!({}), Utc::now()).is_err());
    }

    #[test]
    fn legacy_succeeded_status_parses_as_completed() {
        assert_eq!(
            StepAttemptStatus::parse_legacy("succeeded"),
            Some(StepAttemptStatus::Completed)
        );
    }

    #[test]
    fn sleep_context_rejected_on_function_step() {
        let mut attempt = StepAttempt::start(
            NamespaceId::new(),
            "attempt-1",
            "run-1",
            "charge-card",
            1,
            StepKind::Function,
            json!({}),
            Utc::now(),
        )
        .expect("valid attempt");

        let sleep = super::SleepContext { resume_at: Utc::now() };
        assert!(attempt.set_sleep_context(sleep, Utc::now()).is_err());
    }
}
