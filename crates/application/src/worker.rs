use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use stepwise_core::{AppError, NamespaceId};
use stepwise_domain::SerializedError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::ports::{Backend, HeartbeatOutcome};
use crate::runtime::{WorkflowContext, WorkflowDefinition, WorkflowSignal};

/// Tunables for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Stable identifier for this process (hostname + pid by default).
    pub worker_id: String,
    /// Maximum number of runs driven concurrently.
    pub concurrency: usize,
    /// Lease duration granted by `claim_run`.
    pub lease_duration_ms: u64,
    /// Upper bound on `wait_for_change`'s long-poll when idle.
    pub poll_timeout: Duration,
    /// Interval between `sweep_expired_leases` calls.
    pub sweep_interval: Duration,
    /// Grace period `stop()` waits for in-flight runs before abandoning them.
    pub shutdown_grace_period: Duration,
}

impl WorkerSettings {
    #[must_use]
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            concurrency: 10,
            lease_duration_ms: 30_000,
            poll_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(10),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

/// A long-lived pool that claims runs, drives them through the runtime, and
/// heartbeats their leases: a per-run `tokio::spawn` plus a `watch`
/// cancellation channel, coordinated through the per-run lease each backend
/// grants directly.
pub struct Worker {
    namespace_id: NamespaceId,
    backend: Arc<dyn Backend>,
    definitions: Arc<HashMap<String, WorkflowDefinition>>,
    settings: WorkerSettings,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    #[must_use]
    pub fn new(
        namespace_id: NamespaceId,
        backend: Arc<dyn Backend>,
        definitions: Arc<HashMap<String, WorkflowDefinition>>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            namespace_id,
            backend,
            definitions,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests shutdown. `run()` will stop claiming new work and, once its
    /// in-flight set drains (or `grace_period` elapses), return.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Runs the claim/drive/heartbeat loop until `stop()` is called and the
    /// in-flight set drains, or the grace period elapses.
    #[tracing::instrument(skip(self), fields(worker_id = %self.settings.worker_id))]
    pub async fn run(&self) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut since_token = 0u64;
        let mut last_sweep = tokio::time::Instant::now();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if in_flight.len() < self.settings.concurrency {
                match self
                    .backend
                    .claim_run(self.namespace_id, &self.settings.worker_id, self.settings.lease_duration_ms)
                    .await
                {
                    Ok(Some(claim)) => {
                        info!(run_id = %claim.run_id, workflow_name = %claim.workflow_name, "claimed run");
                        let task = self.spawn_run(claim);
                        in_flight.spawn(task);
                        continue;
                    }
                    Ok(None) => {
                        if let Ok(token) = self
                            .backend
                            .wait_for_change(self.namespace_id, since_token, self.settings.poll_timeout)
                            .await
                        {
                            since_token = token;
                        }
                    }
                    Err(error) => {
                        error!(%error, "claim_run failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            } else {
                let _ = in_flight.join_next().await;
            }

            if last_sweep.elapsed() >= self.settings.sweep_interval {
                match self.backend.sweep_expired_leases(self.namespace_id, Utc::now()).await {
                    Ok(count) if count > 0 => debug!(count, "swept expired leases"),
                    Ok(_) => {}
                    Err(error) => warn!(%error, "sweep_expired_leases failed"),
                }
                last_sweep = tokio::time::Instant::now();
            }
        }

        let drained = tokio::time::timeout(self.settings.shutdown_grace_period, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("shutdown grace period elapsed with runs still in flight; abandoning them");
        }
    }

    fn spawn_run(&self, claim: crate::ports::ClaimedRun) -> impl std::future::Future<Output = ()> + Send + 'static {
        let backend = Arc::clone(&self.backend);
        let definitions = Arc::clone(&self.definitions);
        let namespace_id = self.namespace_id;
        let worker_id = self.settings.worker_id.clone();
        let lease_duration_ms = self.settings.lease_duration_ms;

        async move {
            let run_id = claim.run_id.clone();
            let (stop_heartbeat_tx, stop_heartbeat_rx) = watch::channel(false);
            let heartbeat_task = tokio::spawn(heartbeat_loop(
                Arc::clone(&backend),
                namespace_id,
                run_id.clone(),
                worker_id.clone(),
                lease_duration_ms,
                stop_heartbeat_rx,
            ));

            let outcome = drive_run(Arc::clone(&backend), &definitions, namespace_id, &worker_id, claim).await;

            let _ = stop_heartbeat_tx.send(true);
            let _ = heartbeat_task.await;

            match outcome {
                RunOutcome::Succeeded => info!(run_id = %run_id, "run succeeded"),
                RunOutcome::Failed => info!(run_id = %run_id, "run failed"),
                RunOutcome::Suspended => debug!(run_id = %run_id, "run suspended on sleep"),
                RunOutcome::LeaseLost => warn!(run_id = %run_id, "lease lost mid-execution, abandoning"),
            }
        }
    }
}

enum RunOutcome {
    Succeeded,
    Failed,
    Suspended,
    LeaseLost,
}

async fn heartbeat_loop(
    backend: Arc<dyn Backend>,
    namespace_id: NamespaceId,
    run_id: String,
    worker_id: String,
    lease_duration_ms: u64,
    mut stop: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(lease_duration_ms / 3).max(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(interval) => {
                match backend.heartbeat(namespace_id, &run_id, &worker_id, lease_duration_ms).await {
                    Ok(HeartbeatOutcome::Extended) => {}
                    Ok(HeartbeatOutcome::Lost) => {
                        warn!(run_id = %run_id, "heartbeat reports lease lost");
                        return;
                    }
                    Err(error) => {
                        warn!(run_id = %run_id, %error, "heartbeat call failed");
                    }
                }
            }
        }
    }
}

async fn drive_run(
    backend: Arc<dyn Backend>,
    definitions: &HashMap<String, WorkflowDefinition>,
    namespace_id: NamespaceId,
    worker_id: &str,
    claim: crate::ports::ClaimedRun,
) -> RunOutcome {
    let Some(definition) = definitions.get(&claim.workflow_name) else {
        let error = SerializedError::new("UnknownWorkflow", format!("no workflow registered as '{}'", claim.workflow_name));
        let _ = backend
            .mark_run_failed(namespace_id, &claim.run_id, worker_id, error.to_value())
            .await;
        return RunOutcome::Failed;
    };

    let ctx = WorkflowContext::new(
        namespace_id,
        claim.run_id.clone(),
        worker_id.to_owned(),
        claim.input,
        Arc::clone(&backend),
        claim.attempts,
    );

    let procedure = definition.procedure();
    match procedure(ctx).await {
        Ok(output) => {
            match backend.mark_run_succeeded(namespace_id, &claim.run_id, worker_id, output).await {
                Ok(()) => RunOutcome::Succeeded,
                Err(AppError::LeaseLost(_)) => RunOutcome::LeaseLost,
                Err(_) => RunOutcome::Failed,
            }
        }
        Err(WorkflowSignal::Suspended) => {
            match backend.release_run(namespace_id, &claim.run_id, worker_id).await {
                Ok(()) => RunOutcome::Suspended,
                Err(AppError::LeaseLost(_)) => RunOutcome::LeaseLost,
                Err(_) => RunOutcome::Suspended,
            }
        }
        Err(WorkflowSignal::LeaseLost) => RunOutcome::LeaseLost,
        Err(WorkflowSignal::Failed(error)) => {
            match backend
                .mark_run_failed(namespace_id, &claim.run_id, worker_id, error.to_value())
                .await
            {
                Ok(()) => RunOutcome::Failed,
                Err(AppError::LeaseLost(_)) => RunOutcome::LeaseLost,
                Err(_) => RunOutcome::Failed,
            }
        }
    }
}
