//! The server relational `Backend`, backed by `sqlx::PgPool`.
//!
//! `claim_run` uses a `FOR UPDATE SKIP LOCKED` CTE so many worker processes
//! can race the same table without blocking each other. `wait_for_change`
//! `LISTEN`s on the per-namespace channel the `workflow_runs_notify_insert`
//! trigger `pg_notify`s, falling back to a bounded poll if the listener
//! connection is ever unavailable.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use stepwise_application::ports::{Backend, ClaimedRun, HeartbeatOutcome};
use stepwise_core::{AppError, AppResult, NamespaceId};
use stepwise_domain::{StepAttempt, StepAttemptStatus, StepKind, WorkflowRun};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `PostgresBackend` owns one connection pool shared by every namespace it
/// serves; callers scope visibility themselves by always passing a
/// `NamespaceId`.
pub struct PostgresBackend {
    pool: PgPool,
    listener: Mutex<Option<PgListener>>,
}

impl PostgresBackend {
    /// Connects to `database_url` and runs pending migrations.
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|error| AppError::BackendFatal(error.to_string()))?;

        sqlx::migrate!("./migrations/postgres")
            .run(&pool)
            .await
            .map_err(|error| AppError::BackendFatal(error.to_string()))?;

        info!(database_url, "postgres backend ready");

        Ok(Self {
            pool,
            listener: Mutex::new(None),
        })
    }

    async fn listener_for(&self, namespace_id: NamespaceId) -> AppResult<()> {
        let mut guard = self.listener.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|error| AppError::BackendTransient(error.to_string()))?;
        listener
            .listen(&format!("workflow_runs_changed_{}", namespace_id.as_uuid()))
            .await
            .map_err(|error| AppError::BackendTransient(error.to_string()))?;
        *guard = Some(listener);
        Ok(())
    }
}

fn parse_step_kind(value: &str) -> AppResult<StepKind> {
    match value {
        "function" => Ok(StepKind::Function),
        "sleep" => Ok(StepKind::Sleep),
        other => Err(AppError::Internal(format!("unknown step kind '{other}'"))),
    }
}

fn step_kind_text(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Function => "function",
        StepKind::Sleep => "sleep",
    }
}

fn parse_run_status(value: &str) -> AppResult<stepwise_domain::WorkflowRunStatus> {
    use stepwise_domain::WorkflowRunStatus;
    match value {
        "pending" => Ok(WorkflowRunStatus::Pending),
        "running" => Ok(WorkflowRunStatus::Running),
        "completed" => Ok(WorkflowRunStatus::Completed),
        "failed" => Ok(WorkflowRunStatus::Failed),
        other => Err(AppError::Internal(format!("unknown run status '{other}'"))),
    }
}

fn db_err(error: sqlx::Error) -> AppError {
    AppError::Internal(error.to_string())
}

fn transient_or_fatal(error: sqlx::Error) -> AppError {
    match &error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => AppError::BackendTransient(error.to_string()),
        _ => AppError::BackendFatal(error.to_string()),
    }
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> AppResult<WorkflowRun> {
    let namespace_id: Uuid = row.try_get("namespace_id").map_err(db_err)?;
    let id: String = row.try_get("id").map_err(db_err)?;
    let workflow_name: String = row.try_get("workflow_name").map_err(db_err)?;
    let input: Value = row.try_get("input").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let output: Option<Value> = row.try_get("output").map_err(db_err)?;
    let error: Option<Value> = row.try_get("error").map_err(db_err)?;
    let worker_id: Option<String> = row.try_get("worker_id").map_err(db_err)?;
    let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at").map_err(db_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_err)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(db_err)?;
    let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(db_err)?;
    let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at").map_err(db_err)?;
    let parent_run_id: Option<String> = row.try_get("parent_run_id").map_err(db_err)?;

    Ok(WorkflowRun::from_parts(
        NamespaceId::from_uuid(namespace_id),
        stepwise_core::NonEmptyString::new(id)?,
        stepwise_core::NonEmptyString::new(workflow_name)?,
        input,
        parse_run_status(&status)?,
        output,
        error,
        worker_id,
        lease_expires_at,
        created_at,
        updated_at,
        started_at,
        finished_at,
        parent_run_id,
    ))
}

fn row_to_attempt(row: &sqlx::postgres::PgRow) -> AppResult<StepAttempt> {
    let namespace_id: Uuid = row.try_get("namespace_id").map_err(db_err)?;
    let id: String = row.try_get("id").map_err(db_err)?;
    let workflow_run_id: String = row.try_get("workflow_run_id").map_err(db_err)?;
    let step_name: String = row.try_get("step_name").map_err(db_err)?;
    let attempt_number: i32 = row.try_get("attempt_number").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let config: Value = row.try_get("config").map_err(db_err)?;
    let context: Value = row.try_get("context").map_err(db_err)?;
    let output: Option<Value> = row.try_get("output").map_err(db_err)?;
    let error: Option<Value> = row.try_get("error").map_err(db_err)?;
    let child_run_id: Option<String> = row.try_get("child_run_id").map_err(db_err)?;
    let started_at: DateTime<Utc> = row.try_get("started_at").map_err(db_err)?;
    let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at").map_err(db_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_err)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(db_err)?;

    let status = StepAttemptStatus::parse_legacy(&status)
        .ok_or_else(|| AppError::Internal(format!("unknown step attempt status '{status}'")))?;

    Ok(StepAttempt::from_parts(
        NamespaceId::from_uuid(namespace_id),
        stepwise_core::NonEmptyString::new(id)?,
        stepwise_core::NonEmptyString::new(workflow_run_id)?,
        stepwise_core::NonEmptyString::new(step_name)?,
        attempt_number as u32,
        parse_step_kind(&kind)?,
        status,
        config,
        context,
        output,
        error,
        started_at,
        finished_at,
        created_at,
        updated_at,
        child_run_id,
    ))
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn enqueue_run(
        &self,
        namespace_id: NamespaceId,
        workflow_name: &str,
        input: Value,
        parent_run_id: Option<String>,
    ) -> AppResult<String> {
        let run_id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO workflow_runs
                (namespace_id, id, workflow_name, input, status, created_at, updated_at, parent_run_id)
             VALUES ($1, $2, $3, $4, 'pending', now(), now(), $5)",
        )
        .bind(namespace_id.as_uuid())
        .bind(&run_id)
        .bind(workflow_name)
        .bind(input)
        .bind(parent_run_id)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        debug!(run_id = %run_id, workflow_name, "enqueued run");
        Ok(run_id)
    }

    async fn claim_run(
        &self,
        namespace_id: NamespaceId,
        worker_id: &str,
        lease_duration_ms: u64,
    ) -> AppResult<Option<ClaimedRun>> {
        let row = sqlx::query(
            "WITH candidate AS (
                 SELECT id FROM workflow_runs
                 WHERE namespace_id = $1
                   AND (status = 'pending' OR (status = 'running' AND lease_expires_at <= now()))
                   AND id NOT IN (
                       SELECT workflow_run_id FROM step_attempts
                       WHERE kind = 'sleep' AND status = 'running'
                         AND (context ->> 'resume_at')::timestamptz > now()
                   )
                 ORDER BY created_at ASC, id ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             UPDATE workflow_runs
             SET status = 'running',
                 worker_id = $2,
                 lease_expires_at = now() + ($3 || ' milliseconds')::interval,
                 updated_at = now(),
                 started_at = COALESCE(started_at, now())
             FROM candidate
             WHERE workflow_runs.namespace_id = $1 AND workflow_runs.id = candidate.id
             RETURNING workflow_runs.*",
        )
        .bind(namespace_id.as_uuid())
        .bind(worker_id)
        .bind(lease_duration_ms.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let run = row_to_run(&row)?;

        let attempt_rows = sqlx::query(
            "SELECT * FROM step_attempts WHERE namespace_id = $1 AND workflow_run_id = $2
             ORDER BY step_name ASC, attempt_number ASC",
        )
        .bind(namespace_id.as_uuid())
        .bind(run.run_id())
        .fetch_all(&self.pool)
        .await
        .map_err(transient_or_fatal)?;
        let attempts = attempt_rows
            .iter()
            .map(row_to_attempt)
            .collect::<AppResult<Vec<_>>>()?;

        info!(run_id = %run.run_id(), worker_id, "claimed run");

        Ok(Some(ClaimedRun {
            run_id: run.run_id().to_owned(),
            workflow_name: run.workflow_name().to_owned(),
            input: run.input().clone(),
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
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET lease_expires_at = now() + ($4 || ' milliseconds')::interval, updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'
               AND lease_expires_at > now()",
        )
        .bind(namespace_id.as_uuid())
        .bind(run_id)
        .bind(worker_id)
        .bind(lease_duration_ms.to_string())
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        if result.rows_affected() == 0 {
            warn!(run_id, worker_id, "heartbeat found lease already lost");
            return Ok(HeartbeatOutcome::Lost);
        }

        Ok(HeartbeatOutcome::Extended)
    }

    async fn release_run(&self, namespace_id: NamespaceId, run_id: &str, worker_id: &str) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'pending', worker_id = NULL, lease_expires_at = NULL, updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'",
        )
        .bind(namespace_id.as_uuid())
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseLost(format!(
                "lease on '{run_id}' not held by '{worker_id}'"
            )));
        }

        Ok(())
    }

    async fn get_run(&self, namespace_id: NamespaceId, run_id: &str) -> AppResult<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE namespace_id = $1 AND id = $2")
            .bind(namespace_id.as_uuid())
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient_or_fatal)?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_attempts(&self, namespace_id: NamespaceId, run_id: &str) -> AppResult<Vec<StepAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM step_attempts WHERE namespace_id = $1 AND workflow_run_id = $2
             ORDER BY step_name ASC, attempt_number ASC",
        )
        .bind(namespace_id.as_uuid())
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        rows.iter().map(row_to_attempt).collect()
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
        let mut tx = self.pool.begin().await.map_err(transient_or_fatal)?;

        let holds_lease = sqlx::query(
            "SELECT 1 FROM workflow_runs
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'
             FOR UPDATE",
        )
        .bind(namespace_id.as_uuid())
        .bind(run_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(transient_or_fatal)?
        .is_some();

        if !holds_lease {
            return Err(AppError::LeaseLost(format!(
                "lease on '{run_id}' not held by '{worker_id}'"
            )));
        }

        let already_completed = sqlx::query(
            "SELECT 1 FROM step_attempts
             WHERE workflow_run_id = $1 AND step_name = $2 AND status = 'completed'",
        )
        .bind(run_id)
        .bind(step_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(transient_or_fatal)?
        .is_some();

        if already_completed {
            return Err(AppError::Conflict(format!(
                "step '{step_name}' already has a completed attempt on run '{run_id}'"
            )));
        }

        let next_attempt: i32 = sqlx::query(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 AS next FROM step_attempts
             WHERE workflow_run_id = $1 AND step_name = $2",
        )
        .bind(run_id)
        .bind(step_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(transient_or_fatal)?
        .try_get("next")
        .map_err(db_err)?;

        let attempt_id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO step_attempts
                (namespace_id, id, workflow_run_id, step_name, attempt_number, kind, status,
                 config, context, started_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'running', $7, $8, now(), now(), now())",
        )
        .bind(namespace_id.as_uuid())
        .bind(&attempt_id)
        .bind(run_id)
        .bind(step_name)
        .bind(next_attempt)
        .bind(step_kind_text(kind))
        .bind(config)
        .bind(context)
        .execute(&mut *tx)
        .await
        .map_err(transient_or_fatal)?;

        tx.commit().await.map_err(transient_or_fatal)?;
        Ok(attempt_id)
    }

    async fn complete_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        output: Value,
    ) -> AppResult<()> {
        self.finish_step_attempt(namespace_id, attempt_id, worker_id, "completed", Some(output), None)
            .await
    }

    async fn fail_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        error: Value,
    ) -> AppResult<()> {
        self.finish_step_attempt(namespace_id, attempt_id, worker_id, "failed", None, Some(error))
            .await
    }

    async fn mark_run_succeeded(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        output: Value,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'completed', output = $4, lease_expires_at = NULL, finished_at = now(), updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'",
        )
        .bind(namespace_id.as_uuid())
        .bind(run_id)
        .bind(worker_id)
        .bind(output)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseLost(format!(
                "lease on '{run_id}' not held by '{worker_id}'"
            )));
        }

        info!(run_id, "run succeeded");
        Ok(())
    }

    async fn mark_run_failed(
        &self,
        namespace_id: NamespaceId,
        run_id: &str,
        worker_id: &str,
        error: Value,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'failed', error = $4, lease_expires_at = NULL, finished_at = now(), updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'",
        )
        .bind(namespace_id.as_uuid())
        .bind(run_id)
        .bind(worker_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseLost(format!(
                "lease on '{run_id}' not held by '{worker_id}'"
            )));
        }

        info!(run_id, "run failed");
        Ok(())
    }

    async fn sweep_expired_leases(&self, namespace_id: NamespaceId, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'pending', worker_id = NULL, lease_expires_at = NULL, updated_at = $2
             WHERE namespace_id = $1 AND status = 'running' AND lease_expires_at <= $2",
        )
        .bind(namespace_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            debug!(count = reclaimed, "swept expired leases");
        }
        Ok(reclaimed)
    }

    async fn wait_for_change(
        &self,
        namespace_id: NamespaceId,
        since_token: u64,
        timeout: StdDuration,
    ) -> AppResult<u64> {
        if self.listener_for(namespace_id).await.is_err() {
            tokio::time::sleep(timeout).await;
            return Ok(since_token + 1);
        }

        let mut guard = self.listener.lock().await;
        let Some(listener) = guard.as_mut() else {
            return Ok(since_token + 1);
        };

        match tokio::time::timeout(timeout, listener.recv()).await {
            Ok(Ok(_notification)) => Ok(since_token + 1),
            Ok(Err(error)) => {
                warn!(%error, "postgres listener connection dropped");
                *guard = None;
                Ok(since_token + 1)
            }
            Err(_elapsed) => Ok(since_token),
        }
    }
}

impl PostgresBackend {
    async fn finish_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        status: &str,
        output: Option<Value>,
        error: Option<Value>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE step_attempts sa
             SET status = $4, output = $5, error = $6, finished_at = now(), updated_at = now()
             FROM workflow_runs wr
             WHERE sa.namespace_id = $1 AND sa.id = $2 AND sa.status = 'running'
               AND wr.namespace_id = sa.namespace_id AND wr.id = sa.workflow_run_id
               AND wr.worker_id = $3 AND wr.status = 'running'",
        )
        .bind(namespace_id.as_uuid())
        .bind(attempt_id)
        .bind(worker_id)
        .bind(status)
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseLost(format!(
                "lease not held by '{worker_id}' for attempt '{attempt_id}'"
            )));
        }

        Ok(())
    }
}
