use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepwise_core::{AppError, AppResult, NamespaceId};
use stepwise_domain::WorkflowRunStatus;
use tracing::instrument;

use crate::ports::Backend;
use crate::runtime::WorkflowDefinition;

/// The cap on `Handle::result()`'s exponential polling backoff.
const RESULT_POLL_MAX_MS: u64 = 5_000;

/// Thin façade exposed to application code: registers workflow definitions
/// and enqueues runs, following a "validate then delegate to the backend"
/// service-layer shape with no HTTP surface in front of it.
#[derive(Clone)]
pub struct WorkflowClient {
    namespace_id: NamespaceId,
    backend: Arc<dyn Backend>,
    definitions: Arc<HashMap<String, WorkflowDefinition>>,
}

/// Builds a `WorkflowClient`'s workflow registry. Registration happens once
/// at startup, before the client is handed to a worker; the registry is
/// read-only thereafter, so no further synchronisation is required.
#[derive(Default)]
pub struct WorkflowClientBuilder {
    definitions: HashMap<String, WorkflowDefinition>,
}

impl WorkflowClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow definition. Duplicate names are a startup error.
    pub fn define_workflow(mut self, definition: WorkflowDefinition) -> AppResult<Self> {
        if self.definitions.contains_key(definition.name()) {
            return Err(AppError::Validation(format!(
                "workflow '{}' is already registered",
                definition.name()
            )));
        }
        self.definitions.insert(definition.name().to_owned(), definition);
        Ok(self)
    }

    #[must_use]
    pub fn build(self, namespace_id: NamespaceId, backend: Arc<dyn Backend>) -> WorkflowClient {
        WorkflowClient {
            namespace_id,
            backend,
            definitions: Arc::new(self.definitions),
        }
    }
}

impl WorkflowClient {
    #[must_use]
    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace_id
    }

    #[must_use]
    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    pub(crate) fn definitions(&self) -> Arc<HashMap<String, WorkflowDefinition>> {
        Arc::clone(&self.definitions)
    }

    /// Enqueues a run of the named workflow and returns a `Handle` to it.
    #[instrument(skip(self, input), fields(workflow_name = %workflow_name))]
    pub async fn run(&self, workflow_name: &str, input: Value) -> AppResult<Handle> {
        if !self.definitions.contains_key(workflow_name) {
            return Err(AppError::Validation(format!(
                "unknown workflow '{workflow_name}'"
            )));
        }

        let run_id = self
            .backend
            .enqueue_run(self.namespace_id, workflow_name, input, None)
            .await?;

        Ok(Handle {
            namespace_id: self.namespace_id,
            run_id,
            backend: Arc::clone(&self.backend),
        })
    }
}

/// A reference to one enqueued run.
pub struct Handle {
    namespace_id: NamespaceId,
    run_id: String,
    backend: Arc<dyn Backend>,
}

impl Handle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.run_id
    }

    /// Polls the backend until the run reaches a terminal state, with
    /// exponential backoff capped at a few seconds. Resolves to the run's
    /// output on success; rejects with the recorded error on failure.
    pub async fn result(&self) -> AppResult<Value> {
        let mut delay_ms = 50u64;

        loop {
            if let Some(outcome) = self.poll_terminal_status().await? {
                return outcome;
            }

            let wait = Duration::from_millis(delay_ms);
            let _ = self
                .backend
                .wait_for_change(self.namespace_id, 0, wait)
                .await?;
            delay_ms = (delay_ms * 2).min(RESULT_POLL_MAX_MS);
        }
    }

    /// Requests a graceful release of the run back to `pending`. Does not
    /// interrupt an in-flight step function; see the design notes on
    /// cancellation.
    pub async fn cancel(&self) -> AppResult<()> {
        let Some(run) = self.backend.get_run(self.namespace_id, &self.run_id).await? else {
            return Err(AppError::NotFound(format!("run '{}' does not exist", self.run_id)));
        };

        let Some(worker_id) = run.worker_id() else {
            // Not currently claimed by any worker — pending, or already
            // terminal — so there is no lease to release.
            return Ok(());
        };

        self.backend
            .release_run(self.namespace_id, &self.run_id, worker_id)
            .await
    }

    async fn poll_terminal_status(&self) -> AppResult<Option<AppResult<Value>>> {
        let Some(run) = self.backend.get_run(self.namespace_id, &self.run_id).await? else {
            return Ok(None);
        };

        match run.status() {
            WorkflowRunStatus::Completed => {
                Ok(Some(Ok(run.output().cloned().unwrap_or(Value::Null))))
            }
            WorkflowRunStatus::Failed => Ok(Some(Err(AppError::StepFailed(
                run.error()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "run failed".to_owned()),
            )))),
            WorkflowRunStatus::Pending | WorkflowRunStatus::Running => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use stepwise_core::NamespaceId;

    use crate::testing::FakeBackend;

    use super::{Handle, WorkflowRunStatus};

    #[tokio::test]
    async fn cancel_releases_the_lease_held_by_the_current_worker() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();

        let run_id = backend
            .enqueue_run(namespace_id, "cancellable", json!({}), None)
            .await
            .expect("enqueue run");
        backend
            .claim_run(namespace_id, "worker-1", 30_000)
            .await
            .expect("claim call")
            .expect("claimable");

        let handle = Handle {
            namespace_id,
            run_id: run_id.clone(),
            backend: Arc::clone(&backend),
        };

        handle.cancel().await.expect("cancel releases the real lease holder");

        let run = backend.get_run(namespace_id, &run_id).await.expect("get run").expect("run exists");
        assert_eq!(run.status(), WorkflowRunStatus::Pending);
        assert!(run.worker_id().is_none());
    }

    #[tokio::test]
    async fn cancel_on_a_run_with_no_active_lease_is_a_no_op() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();

        let run_id = backend
            .enqueue_run(namespace_id, "idle", json!({}), None)
            .await
            .expect("enqueue run");

        let handle = Handle {
            namespace_id,
            run_id: run_id.clone(),
            backend: Arc::clone(&backend),
        };

        handle.cancel().await.expect("cancelling an unclaimed run is a no-op");

        let run = backend.get_run(namespace_id, &run_id).await.expect("get run").expect("run exists");
        assert_eq!(run.status(), WorkflowRunStatus::Pending);
    }
}
