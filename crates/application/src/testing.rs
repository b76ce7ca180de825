//! An in-memory `Backend` double for fast application-layer tests.
//!
//! A `tokio::sync::Mutex`-guarded in-memory store behind the same trait real
//! backends implement, so application and runtime tests never need a real
//! database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_core::{AppError, AppResult, NamespaceId};
use stepwise_domain::{SleepContext, StepAttempt, StepAttemptStatus, StepKind, WorkflowRun, WorkflowRunStatus};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::ports::{Backend, ClaimedRun, HeartbeatOutcome};

struct Store {
    runs: HashMap<String, WorkflowRun>,
    attempts: HashMap<String, StepAttempt>,
    change_token: u64,
}

/// In-memory `Backend` used by application and runtime tests, and as the
/// first leg of the conformance suite in [`crate::testing::conformance`].
pub struct FakeBackend {
    store: Mutex<Store>,
    notify: Notify,
    next_attempt_number: AtomicU64,
}

impl FakeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store {
                runs: HashMap::new(),
                attempts: HashMap::new(),
                change_token: 0,
            }),
            notify: Notify::new(),
            next_attempt_number: AtomicU64::new(1),
        }
    }

    fn is_sleep_blocked(run_id: &str, attempts: &HashMap<String, StepAttempt>, now: DateTime<Utc>) -> bool {
        attempts.values().any(|attempt| {
            attempt.workflow_run_id() == run_id
                && attempt.kind() == StepKind::Sleep
                && attempt.status() == StepAttemptStatus::Running
                && serde_json::from_value::<SleepContext>(attempt.context().clone())
                    .map(|sleep| sleep.resume_at > now)
                    .unwrap_or(false)
        })
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn enqueue_run(
        &self,
        namespace_id: NamespaceId,
        workflow_name: &str,
        input: Value,
        parent_run_id: Option<String>,
    ) -> AppResult<String> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let run = WorkflowRun::new(namespace_id, run_id.clone(), workflow_name, input, now, parent_run_id)?;
        store.runs.insert(run_id.clone(), run);
        store.change_token += 1;
        drop(store);
        self.notify.notify_waiters();
        Ok(run_id)
    }

    async fn claim_run(
        &self,
        namespace_id: NamespaceId,
        worker_id: &str,
        lease_duration_ms: u64,
    ) -> AppResult<Option<ClaimedRun>> {
        let mut store = self.store.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<&WorkflowRun> = store
            .runs
            .values()
            .filter(|run| run.namespace_id() == namespace_id)
            .filter(|run| {
                let runnable = run.status() == WorkflowRunStatus::Pending
                    || (run.status() == WorkflowRunStatus::Running
                        && run.lease_expires_at().is_some_and(|expires| expires <= now));
                runnable && !Self::is_sleep_blocked(run.run_id(), &store.attempts, now)
            })
            .collect();

        candidates.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.run_id().cmp(b.run_id())));

        let Some(chosen_id) = candidates.first().map(|run| run.run_id().to_owned()) else {
            return Ok(None);
        };

        let lease_expires_at = now + chrono::Duration::milliseconds(lease_duration_ms as i64);
        let run = store.runs.get_mut(&chosen_id).expect("candidate exists");
        run.mark_running(worker_id, lease_expires_at, now)?;

        let workflow_name = run.workflow_name().to_owned();
        let input = run.input().clone();
        let run_id = run.run_id().to_owned();

        let mut attempts: Vec<StepAttempt> = store
            .attempts
            .values()
            .filter(|attempt| attempt.workflow_run_id() == run_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| a.step_name().cmp(b.step_name()).then(a.attempt_number().cmp(&b.attempt_number())));

        store.change_token += 1;

        Ok(Some(ClaimedRun {
            run_id,
            workflow_name,
            input,
            attempts,
        }))
    }

    async fn heartbeat(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        lease_duration_ms: u64,
    ) -> AppResult<HeartbeatOutcome> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let Some(run) = store.runs.get_mut(run_id) else {
            return Ok(HeartbeatOutcome::Lost);
        };

        if run.namespace_id() != namespace_id
            || run.status() != WorkflowRunStatus::Running
            || run.worker_id() != Some(worker_id)
            || run.lease_expires_at().is_some_and(|expires| expires <= now)
        {
            return Ok(HeartbeatOutcome::Lost);
        }

        let lease_expires_at = now + chrono::Duration::milliseconds(lease_duration_ms as i64);
        run.requeue(Some(lease_expires_at), now);
        Ok(HeartbeatOutcome::Extended)
    }

    async fn release_run(&self, namespace_id: NamespaceId, run_id: &str, worker_id: &str) -> AppResult<()> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let run = store
            .runs
            .get_mut(run_id)
            .ok_or_else(|| AppError::NotFound(format!("run '{run_id}' not found")))?;

        if run.namespace_id() != namespace_id || run.worker_id() != Some(worker_id) {
            return Err(AppError::LeaseLost(format!("lease on '{run_id}' not held by '{worker_id}'")));
        }

        run.requeue(None, now);
        store.change_token += 1;
        drop(store);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_run(&self, namespace_id: NamespaceId, run_id: &str) -> AppResult<Option<WorkflowRun>> {
        let store = self.store.lock().await;
        Ok(store
            .runs
            .get(run_id)
            .filter(|run| run.namespace_id() == namespace_id)
            .cloned())
    }

    async fn list_attempts(&self, namespace_id: NamespaceId, run_id: &str) -> AppResult<Vec<StepAttempt>> {
        let store = self.store.lock().await;
        let mut attempts: Vec<StepAttempt> = store
            .attempts
            .values()
            .filter(|attempt| attempt.namespace_id() == namespace_id && attempt.workflow_run_id() == run_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| a.step_name().cmp(b.step_name()).then(a.attempt_number().cmp(&b.attempt_number())));
        Ok(attempts)
    }

    async fn start_step_attempt(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        step_name: &str,
        kind: StepKind,
        config: Value,
        context: Value,
    ) -> AppResult<String> {
        let mut store = self.store.lock().await;
        let now = Utc::now();

        {
            let run = store
                .runs
                .get(run_id)
                .ok_or_else(|| AppError::NotFound(format!("run '{run_id}' not found")))?;
            if run.worker_id() != Some(worker_id) || run.status() != WorkflowRunStatus::Running {
                return Err(AppError::LeaseLost(format!("lease on '{run_id}' not held by '{worker_id}'")));
            }
        }

        let already_completed = store.attempts.values().any(|attempt| {
            attempt.workflow_run_id() == run_id
                && attempt.step_name() == step_name
                && attempt.status() == StepAttemptStatus::Completed
        });
        if already_completed {
            return Err(AppError::Conflict(format!(
                "step '{step_name}' already has a completed attempt on run '{run_id}'"
            )));
        }

        let attempt_number = self.next_attempt_number.fetch_add(1, Ordering::SeqCst);
        let attempt_id = Uuid::new_v4().to_string();
        let mut attempt = StepAttempt::start(
            namespace_id,
            attempt_id.clone(),
            run_id,
            step_name,
            attempt_number as u32,
            kind,
            config,
            now,
        )?;
        if kind == StepKind::Sleep {
            if let Ok(sleep) = serde_json::from_value::<SleepContext>(context) {
                attempt.set_sleep_context(sleep, now)?;
            }
        }

        store.attempts.insert(attempt_id.clone(), attempt);
        store.change_token += 1;
        Ok(attempt_id)
    }

    async fn complete_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        output: Value,
    ) -> AppResult<()> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        self.assert_lease_for_attempt(&store, namespace_id, attempt_id, worker_id)?;
        let attempt = store
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| AppError::NotFound(format!("attempt '{attempt_id}' not found")))?;
        attempt.complete(output, now)?;
        store.change_token += 1;
        Ok(())
    }

    async fn fail_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        error: Value,
    ) -> AppResult<()> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        self.assert_lease_for_attempt(&store, namespace_id, attempt_id, worker_id)?;
        let attempt = store
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| AppError::NotFound(format!("attempt '{attempt_id}' not found")))?;
        attempt.fail(error, now)?;
        store.change_token += 1;
        Ok(())
    }

    async fn mark_run_succeeded(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        output: Value,
    ) -> AppResult<()> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let run = store
            .runs
            .get_mut(run_id)
            .ok_or_else(|| AppError::NotFound(format!("run '{run_id}' not found")))?;
        if run.namespace_id() != namespace_id || run.worker_id() != Some(worker_id) {
            return Err(AppError::LeaseLost(format!("lease on '{run_id}' not held by '{worker_id}'")));
        }
        run.mark_succeeded(output, now)?;
        store.change_token += 1;
        drop(store);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn mark_run_failed(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        error: Value,
    ) -> AppResult<()> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let run = store
            .runs
            .get_mut(run_id)
            .ok_or_else(|| AppError::NotFound(format!("run '{run_id}' not found")))?;
        if run.namespace_id() != namespace_id || run.worker_id() != Some(worker_id) {
            return Err(AppError::LeaseLost(format!("lease on '{run_id}' not held by '{worker_id}'")));
        }
        run.mark_failed(error, now)?;
        store.change_token += 1;
        drop(store);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn sweep_expired_leases(&self, namespace_id: NamespaceId, now: DateTime<Utc>) -> AppResult<u64> {
        let mut store = self.store.lock().await;
        let mut reclaimed = 0u64;
        for run in store.runs.values_mut() {
            if run.namespace_id() == namespace_id
                && run.status() == WorkflowRunStatus::Running
                && run.lease_expires_at().is_some_and(|expires| expires <= now)
            {
                run.requeue(None, now);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            store.change_token += 1;
        }
        Ok(reclaimed)
    }

    async fn wait_for_change(
        &self,
        _namespace_id: NamespaceId,
        since_token: u64,
        timeout: std::time::Duration,
    ) -> AppResult<u64> {
        {
            let store = self.store.lock().await;
            if store.change_token > since_token {
                return Ok(store.change_token);
            }
        }

        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        Ok(self.store.lock().await.change_token)
    }
}

impl FakeBackend {
    fn assert_lease_for_attempt(
        &self,
        store: &Store,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
    ) -> AppResult<()> {
        let attempt = store
            .attempts
            .get(attempt_id)
            .ok_or_else(|| AppError::NotFound(format!("attempt '{attempt_id}' not found")))?;
        let run = store
            .runs
            .get(attempt.workflow_run_id())
            .ok_or_else(|| AppError::NotFound(format!("run '{}' not found", attempt.workflow_run_id())))?;

        if run.namespace_id() != namespace_id || run.worker_id() != Some(worker_id) {
            return Err(AppError::LeaseLost(format!(
                "lease on '{}' not held by '{worker_id}'",
                attempt.workflow_run_id()
            )));
        }

        Ok(())
    }
}
