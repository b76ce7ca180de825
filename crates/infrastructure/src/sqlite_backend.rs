//! The embedded single-file `Backend`, backed by `sqlx::SqlitePool`.
//!
//! `claim_run` opens its transaction with `BEGIN IMMEDIATE`, which
//! serialises writers at the SQLite level and stands in for `FOR UPDATE
//! SKIP LOCKED` under single-writer semantics. `wait_for_change` is backed
//! by an in-process `tokio::sync::Notify` woken on every mutating call — a
//! condition-variable-style wakeup rather than polling, since the store is
//! local.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use stepwise_application::ports::{Backend, ClaimedRun, HeartbeatOutcome};
use stepwise_core::{AppError, AppResult, NamespaceId};
use stepwise_domain::{StepAttempt, StepAttemptStatus, StepKind, WorkflowRun, WorkflowRunStatus};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `SqliteBackend` owns one pool against a single on-disk file (or
/// `:memory:` for tests); every connection shares the same writer lock.
pub struct SqliteBackend {
    pool: SqlitePool,
    notify: Notify,
    change_token: AtomicU64,
}

impl SqliteBackend {
    /// Connects to `database_url` (e.g. `sqlite://data.db` or
    /// `sqlite::memory:`) and runs pending migrations.
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|error| AppError::BackendFatal(error.to_string()))?;

        sqlx::migrate!("./migrations/sqlite")
            .run(&pool)
            .await
            .map_err(|error| AppError::BackendFatal(error.to_string()))?;

        info!(database_url, "sqlite backend ready");

        Ok(Self {
            pool,
            notify: Notify::new(),
            change_token: AtomicU64::new(0),
        })
    }

    fn bump_and_notify(&self) -> u64 {
        let token = self.change_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify.notify_waiters();
        token
    }
}

/// Formats with fixed millisecond precision and a `Z` suffix so stored
/// timestamps stay lexically sortable — `claim_run`'s sleep-admission
/// filter compares them as plain text.
fn to_rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| AppError::Internal(format!("malformed timestamp '{value}': {error}")))
}

fn parse_run_status(value: &str) -> AppResult<WorkflowRunStatus> {
    match value {
        "pending" => Ok(WorkflowRunStatus::Pending),
        "running" => Ok(WorkflowRunStatus::Running),
        "completed" => Ok(WorkflowRunStatus::Completed),
        "failed" => Ok(WorkflowRunStatus::Failed),
        other => Err(AppError::Internal(format!("unknown run status '{other}'"))),
    }
}

fn step_kind_text(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Function => "function",
        StepKind::Sleep => "sleep",
    }
}

fn parse_step_kind(value: &str) -> AppResult<StepKind> {
    match value {
        "function" => Ok(StepKind::Function),
        "sleep" => Ok(StepKind::Sleep),
        other => Err(AppError::Internal(format!("unknown step kind '{other}'"))),
    }
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> AppResult<WorkflowRun> {
    let namespace_id = Uuid::parse_str(row.try_get::<String, _>("namespace_id").map_err(db_err)?.as_str())
        .map_err(|error| AppError::Internal(error.to_string()))?;
    let id: String = row.try_get("id").map_err(db_err)?;
    let workflow_name: String = row.try_get("workflow_name").map_err(db_err)?;
    let input: String = row.try_get("input").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let output: Option<String> = row.try_get("output").map_err(db_err)?;
    let error: Option<String> = row.try_get("error").map_err(db_err)?;
    let worker_id: Option<String> = row.try_get("worker_id").map_err(db_err)?;
    let lease_expires_at: Option<String> = row.try_get("lease_expires_at").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(db_err)?;
    let finished_at: Option<String> = row.try_get("finished_at").map_err(db_err)?;
    let parent_run_id: Option<String> = row.try_get("parent_run_id").map_err(db_err)?;

    Ok(WorkflowRun::from_parts(
        NamespaceId::from_uuid(namespace_id),
        stepwise_core::NonEmptyString::new(id)?,
        stepwise_core::NonEmptyString::new(workflow_name)?,
        serde_json::from_str(&input).map_err(|error| AppError::Internal(error.to_string()))?,
        parse_run_status(&status)?,
        output
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(|error| AppError::Internal(error.to_string()))?,
        error
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(|error| AppError::Internal(error.to_string()))?,
        worker_id,
        lease_expires_at.map(|value| parse_timestamp(&value)).transpose()?,
        parse_timestamp(&created_at)?,
        parse_timestamp(&updated_at)?,
        started_at.map(|value| parse_timestamp(&value)).transpose()?,
        finished_at.map(|value| parse_timestamp(&value)).transpose()?,
        parent_run_id,
    ))
}

fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> AppResult<StepAttempt> {
    let namespace_id = Uuid::parse_str(row.try_get::<String, _>("namespace_id").map_err(db_err)?.as_str())
        .map_err(|error| AppError::Internal(error.to_string()))?;
    let id: String = row.try_get("id").map_err(db_err)?;
    let workflow_run_id: String = row.try_get("workflow_run_id").map_err(db_err)?;
    let step_name: String = row.try_get("step_name").map_err(db_err)?;
    let attempt_number: i64 = row.try_get("attempt_number").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let config: String = row.try_get("config").map_err(db_err)?;
    let context: String = row.try_get("context").map_err(db_err)?;
    let output: Option<String> = row.try_get("output").map_err(db_err)?;
    let error: Option<String> = row.try_get("error").map_err(db_err)?;
    let child_run_id: Option<String> = row.try_get("child_run_id").map_err(db_err)?;
    let started_at: String = row.try_get("started_at").map_err(db_err)?;
    let finished_at: Option<String> = row.try_get("finished_at").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;

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
        serde_json::from_str(&config).map_err(|error| AppError::Internal(error.to_string()))?,
        serde_json::from_str(&context).map_err(|error| AppError::Internal(error.to_string()))?,
        output
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(|error| AppError::Internal(error.to_string()))?,
        error
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(|error| AppError::Internal(error.to_string()))?,
        parse_timestamp(&started_at)?,
        finished_at.map(|value| parse_timestamp(&value)).transpose()?,
        parse_timestamp(&created_at)?,
        parse_timestamp(&updated_at)?,
        child_run_id,
    ))
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

#[async_trait]
impl Backend for SqliteBackend {
    async fn enqueue_run(
        &self,
        namespace_id: NamespaceId,
        workflow_name: &str,
        input: Value,
        parent_run_id: Option<String>,
    ) -> AppResult<String> {
        let run_id = Uuid::new_v4().to_string();
        let now = to_rfc3339(Utc::now());
        let input_text = serde_json::to_string(&input).map_err(|error| AppError::Internal(error.to_string()))?;

        sqlx::query(
            "INSERT INTO workflow_runs
                (namespace_id, id, workflow_name, input, status, created_at, updated_at, parent_run_id)
             VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)",
        )
        .bind(namespace_id.as_uuid().to_string())
        .bind(&run_id)
        .bind(workflow_name)
        .bind(input_text)
        .bind(&now)
        .bind(&now)
        .bind(parent_run_id)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        self.bump_and_notify();
        debug!(run_id = %run_id, workflow_name, "enqueued run");
        Ok(run_id)
    }

    async fn claim_run(
        &self,
        namespace_id: NamespaceId,
        worker_id: &str,
        lease_duration_ms: u64,
    ) -> AppResult<Option<ClaimedRun>> {
        let mut conn = self.pool.acquire().await.map_err(transient_or_fatal)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(transient_or_fatal)?;

        let now = Utc::now();
        let now_text = to_rfc3339(now);

        let candidate = sqlx::query(
            "SELECT id FROM workflow_runs
             WHERE namespace_id = ?
               AND (status = 'pending' OR (status = 'running' AND lease_expires_at <= ?))
               AND id NOT IN (
                   SELECT workflow_run_id FROM step_attempts
                   WHERE kind = 'sleep' AND status = 'running'
                     AND json_extract(context, '$.resume_at') > ?
               )
             ORDER BY created_at ASC, id ASC
             LIMIT 1",
        )
        .bind(namespace_id.as_uuid().to_string())
        .bind(&now_text)
        .bind(&now_text)
        .fetch_optional(&mut *conn)
        .await
        .map_err(transient_or_fatal)?;

        let Some(candidate_row) = candidate else {
            sqlx::query("COMMIT").execute(&mut *conn).await.map_err(transient_or_fatal)?;
            return Ok(None);
        };

        let run_id: String = candidate_row.try_get("id").map_err(db_err)?;
        let lease_expires_at = to_rfc3339(now + chrono::Duration::milliseconds(lease_duration_ms as i64));

        sqlx::query(
            "UPDATE workflow_runs
             SET status = 'running', worker_id = ?, lease_expires_at = ?, updated_at = ?,
                 started_at = COALESCE(started_at, ?)
             WHERE namespace_id = ? AND id = ?",
        )
        .bind(worker_id)
        .bind(&lease_expires_at)
        .bind(&now_text)
        .bind(&now_text)
        .bind(namespace_id.as_uuid().to_string())
        .bind(&run_id)
        .execute(&mut *conn)
        .await
        .map_err(transient_or_fatal)?;

        let run_row = sqlx::query("SELECT * FROM workflow_runs WHERE namespace_id = ? AND id = ?")
            .bind(namespace_id.as_uuid().to_string())
            .bind(&run_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(transient_or_fatal)?;
        let run = row_to_run(&run_row)?;

        let attempt_rows = sqlx::query(
            "SELECT * FROM step_attempts WHERE namespace_id = ? AND workflow_run_id = ?
             ORDER BY step_name ASC, attempt_number ASC",
        )
        .bind(namespace_id.as_uuid().to_string())
        .bind(&run_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(transient_or_fatal)?;
        let attempts = attempt_rows
            .iter()
            .map(row_to_attempt)
            .collect::<AppResult<Vec<_>>>()?;

        sqlx::query("COMMIT").execute(&mut *conn).await.map_err(transient_or_fatal)?;
        drop(conn);

        self.bump_and_notify();
        info!(run_id = %run_id, worker_id, "claimed run");

        Ok(Some(ClaimedRun {
            run_id,
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
        let now = Utc::now();
        let lease_expires_at = to_rfc3339(now + chrono::Duration::milliseconds(lease_duration_ms as i64));

        let result = sqlx::query(
            "UPDATE workflow_runs
             SET lease_expires_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'
               AND lease_expires_at > ?",
        )
        .bind(&lease_expires_at)
        .bind(to_rfc3339(now))
        .bind(namespace_id.as_uuid().to_string())
        .bind(run_id)
        .bind(worker_id)
        .bind(to_rfc3339(now))
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
             SET status = 'pending', worker_id = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'",
        )
        .bind(to_rfc3339(Utc::now()))
        .bind(namespace_id.as_uuid().to_string())
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

        self.bump_and_notify();
        Ok(())
    }

    async fn get_run(&self, namespace_id: NamespaceId, run_id: &str) -> AppResult<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE namespace_id = ? AND id = ?")
            .bind(namespace_id.as_uuid().to_string())
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient_or_fatal)?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_attempts(&self, namespace_id: NamespaceId, run_id: &str) -> AppResult<Vec<StepAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM step_attempts WHERE namespace_id = ? AND workflow_run_id = ?
             ORDER BY step_name ASC, attempt_number ASC",
        )
        .bind(namespace_id.as_uuid().to_string())
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
        let mut conn = self.pool.acquire().await.map_err(transient_or_fatal)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(transient_or_fatal)?;

        let holds_lease = sqlx::query(
            "SELECT 1 FROM workflow_runs
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'",
        )
        .bind(namespace_id.as_uuid().to_string())
        .bind(run_id)
        .bind(worker_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(transient_or_fatal)?
        .is_some();

        if !holds_lease {
            sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
            return Err(AppError::LeaseLost(format!(
                "lease on '{run_id}' not held by '{worker_id}'"
            )));
        }

        let already_completed = sqlx::query(
            "SELECT 1 FROM step_attempts
             WHERE workflow_run_id = ? AND step_name = ? AND status = 'completed'",
        )
        .bind(run_id)
        .bind(step_name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(transient_or_fatal)?
        .is_some();

        if already_completed {
            sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
            return Err(AppError::Conflict(format!(
                "step '{step_name}' already has a completed attempt on run '{run_id}'"
            )));
        }

        let next_attempt: i64 = sqlx::query(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 AS next FROM step_attempts
             WHERE workflow_run_id = ? AND step_name = ?",
        )
        .bind(run_id)
        .bind(step_name)
        .fetch_one(&mut *conn)
        .await
        .map_err(transient_or_fatal)?
        .try_get("next")
        .map_err(db_err)?;

        let attempt_id = Uuid::new_v4().to_string();
        let now = to_rfc3339(Utc::now());

        sqlx::query(
            "INSERT INTO step_attempts
                (namespace_id, id, workflow_run_id, step_name, attempt_number, kind, status,
                 config, context, started_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'running', ?, ?, ?, ?, ?)",
        )
        .bind(namespace_id.as_uuid().to_string())
        .bind(&attempt_id)
        .bind(run_id)
        .bind(step_name)
        .bind(next_attempt)
        .bind(step_kind_text(kind))
        .bind(serde_json::to_string(&config).map_err(|error| AppError::Internal(error.to_string()))?)
        .bind(serde_json::to_string(&context).map_err(|error| AppError::Internal(error.to_string()))?)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await
        .map_err(transient_or_fatal)?;

        sqlx::query("COMMIT").execute(&mut *conn).await.map_err(transient_or_fatal)?;
        self.bump_and_notify();
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
        let now = to_rfc3339(Utc::now());
        let output_text = serde_json::to_string(&output).map_err(|error| AppError::Internal(error.to_string()))?;

        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'completed', output = ?, lease_expires_at = NULL, finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'",
        )
        .bind(output_text)
        .bind(&now)
        .bind(&now)
        .bind(namespace_id.as_uuid().to_string())
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

        self.bump_and_notify();
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
        let now = to_rfc3339(Utc::now());
        let error_text = serde_json::to_string(&error).map_err(|error| AppError::Internal(error.to_string()))?;

        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'failed', error = ?, lease_expires_at = NULL, finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'",
        )
        .bind(error_text)
        .bind(&now)
        .bind(&now)
        .bind(namespace_id.as_uuid().to_string())
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

        self.bump_and_notify();
        info!(run_id, "run failed");
        Ok(())
    }

    async fn sweep_expired_leases(&self, namespace_id: NamespaceId, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'pending', worker_id = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE namespace_id = ? AND status = 'running' AND lease_expires_at <= ?",
        )
        .bind(to_rfc3339(now))
        .bind(namespace_id.as_uuid().to_string())
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            self.bump_and_notify();
            debug!(count = reclaimed, "swept expired leases");
        }
        Ok(reclaimed)
    }

    async fn wait_for_change(
        &self,
        _namespace_id: NamespaceId,
        since_token: u64,
        timeout: StdDuration,
    ) -> AppResult<u64> {
        if self.change_token.load(Ordering::SeqCst) > since_token {
            return Ok(self.change_token.load(Ordering::SeqCst));
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        Ok(self.change_token.load(Ordering::SeqCst))
    }
}

impl SqliteBackend {
    async fn finish_step_attempt(
        &self,
        namespace_id: NamespaceId,
        attempt_id: &str,
        worker_id: &str,
        status: &str,
        output: Option<Value>,
        error: Option<Value>,
    ) -> AppResult<()> {
        let now = to_rfc3339(Utc::now());
        let output_text = output
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .map_err(|error| AppError::Internal(error.to_string()))?;
        let error_text = error
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .map_err(|error| AppError::Internal(error.to_string()))?;

        let result = sqlx::query(
            "UPDATE step_attempts
             SET status = ?, output = ?, error = ?, finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND status = 'running'
               AND workflow_run_id IN (
                   SELECT id FROM workflow_runs WHERE id = workflow_run_id AND worker_id = ? AND status = 'running'
               )",
        )
        .bind(status)
        .bind(output_text)
        .bind(error_text)
        .bind(&now)
        .bind(&now)
        .bind(namespace_id.as_uuid().to_string())
        .bind(attempt_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(transient_or_fatal)?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseLost(format!(
                "lease not held by '{worker_id}' for attempt '{attempt_id}'"
            )));
        }

        self.bump_and_notify();
        Ok(())
    }
}
