//! The durable workflow runtime, worker, and backend contract.
//!
//! `ports` defines the trait infrastructure implements; the rest of the
//! crate is pure orchestration against that trait.

#![forbid(unsafe_code)]

pub mod client;
pub mod conformance;
pub mod ports;
pub mod runtime;
pub mod step_cache;
pub mod testing;
pub mod worker;

pub use client::{Handle, WorkflowClient, WorkflowClientBuilder};
pub use ports::{Backend, ClaimedRun, HeartbeatOutcome};
pub use runtime::{Step, WorkflowContext, WorkflowDefinition, WorkflowProcedure, WorkflowSignal};
pub use step_cache::StepCache;
pub use worker::{Worker, WorkerSettings};

#[cfg(test)]
mod end_to_end_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use stepwise_core::NamespaceId;

    use crate::client::WorkflowClientBuilder;
    use crate::conformance;
    use crate::runtime::WorkflowDefinition;
    use crate::testing::FakeBackend;
    use crate::worker::{Worker, WorkerSettings};

    #[tokio::test]
    async fn two_step_success_end_to_end() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();

        let definition = WorkflowDefinition::new(
            "two-step",
            Arc::new(|ctx: crate::runtime::WorkflowContext| -> crate::runtime::StepFuture {
                Box::pin(async move {
                    let step = ctx.step();
                    let a: i64 = step.run("a", || async { Ok(1i64) }).await?;
                    let b: i64 = step.run("b", || async move { Ok(a + 2) }).await?;
                    Ok(json!(b))
                })
            }),
        );

        let client = WorkflowClientBuilder::new()
            .define_workflow(definition.clone())
            .expect("register workflow")
            .build(namespace_id, Arc::clone(&backend));

        let mut definitions = std::collections::HashMap::new();
        definitions.insert(definition.name().to_owned(), definition);

        let worker = Worker::new(
            namespace_id,
            Arc::clone(&backend),
            Arc::new(definitions),
            WorkerSettings::new("worker-1"),
        );

        let handle = client.run("two-step", json!({})).await.expect("enqueue run");

        let worker_task = tokio::spawn(async move { worker.run().await });
        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .expect("worker drives the run to completion")
            .expect("run succeeds");
        worker_task.abort();

        assert_eq!(result, json!(3));

        let attempts = backend
            .list_attempts(namespace_id, handle.id())
            .await
            .expect("list attempts");
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn replay_memoisation_does_not_reinvoke_completed_steps() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_for_workflow = Arc::clone(&counter);
        let definition = WorkflowDefinition::new(
            "counting",
            Arc::new(move |ctx: crate::runtime::WorkflowContext| -> crate::runtime::StepFuture {
                let counter = Arc::clone(&counter_for_workflow);
                Box::pin(async move {
                    let step = ctx.step();
                    let value: i64 = step
                        .run("x", || async move { Ok(counter.fetch_add(1, Ordering::SeqCst) as i64) })
                        .await?;
                    Ok(json!(value))
                })
            }),
        );

        let run_id = backend
            .enqueue_run(namespace_id, "counting", json!({}), None)
            .await
            .expect("enqueue run");

        // First claim: executes the step and increments the counter once.
        let claim = backend
            .claim_run(namespace_id, "worker-1", 30_000)
            .await
            .expect("claim call")
            .expect("claimable");
        let ctx = crate::runtime::WorkflowContext::new(
            namespace_id,
            claim.run_id.clone(),
            "worker-1".to_owned(),
            claim.input.clone(),
            Arc::clone(&backend),
            claim.attempts.clone(),
        );
        let output: Value = (definition.procedure())(ctx).await.expect("first execution succeeds");
        backend
            .mark_run_succeeded(namespace_id, &run_id, "worker-1", output)
            .await
            .expect("mark succeeded");

        // Simulate a crash-and-reclaim replay against the same attempt
        // history: the step must not execute `fn` again.
        let attempts = backend
            .list_attempts(namespace_id, &run_id)
            .await
            .expect("list attempts");
        let replay_ctx = crate::runtime::WorkflowContext::new(
            namespace_id,
            run_id,
            "worker-2".to_owned(),
            json!({}),
            Arc::clone(&backend),
            attempts,
        );
        let replayed: Value = (definition.procedure())(replay_ctx)
            .await
            .expect("replay reuses the cached output");

        assert_eq!(replayed, json!(0));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sleep_suspends_and_a_later_claim_completes_it() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();

        let run_id = backend
            .enqueue_run(namespace_id, "napper", json!({}), None)
            .await
            .expect("enqueue run");

        let claim = backend
            .claim_run(namespace_id, "worker-1", 30_000)
            .await
            .expect("claim call")
            .expect("claimable");
        let ctx = crate::runtime::WorkflowContext::new(
            namespace_id,
            claim.run_id.clone(),
            "worker-1".to_owned(),
            claim.input,
            Arc::clone(&backend),
            claim.attempts,
        );

        let step = ctx.step();
        let _first: Result<(), _> = step.run("s1", || async { Ok(()) }).await;
        let sleep_outcome = step.sleep("nap", "20ms").await;
        assert!(matches!(sleep_outcome, Err(crate::runtime::WorkflowSignal::Suspended)));

        backend
            .release_run(namespace_id, &run_id, "worker-1")
            .await
            .expect("release on suspend");

        tokio::time::sleep(Duration::from_millis(40)).await;

        let second_claim = backend
            .claim_run(namespace_id, "worker-2", 30_000)
            .await
            .expect("claim call")
            .expect("claimable again once the sleep has elapsed");

        let replay_ctx = crate::runtime::WorkflowContext::new(
            namespace_id,
            second_claim.run_id.clone(),
            "worker-2".to_owned(),
            second_claim.input,
            Arc::clone(&backend),
            second_claim.attempts,
        );
        let replay_step = replay_ctx.step();
        let _s1_again: Result<(), _> = replay_step.run("s1", || async { Ok(()) }).await;
        let nap_result = replay_step.sleep("nap", "20ms").await;
        assert!(nap_result.is_ok(), "sleep must complete once resume_at has elapsed");

        let attempts = backend
            .list_attempts(namespace_id, &run_id)
            .await
            .expect("list attempts");
        let nap_attempt = attempts.iter().find(|attempt| attempt.step_name() == "nap").expect("nap attempt");
        assert_eq!(nap_attempt.status(), stepwise_domain::StepAttemptStatus::Completed);
    }

    #[tokio::test]
    async fn worker_releases_lease_on_sleep_and_resumes_on_reclaim() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();

        let definition = WorkflowDefinition::new(
            "napper",
            Arc::new(|ctx: crate::runtime::WorkflowContext| -> crate::runtime::StepFuture {
                Box::pin(async move {
                    let step = ctx.step();
                    let _: () = step.run("s1", || async { Ok(()) }).await?;
                    step.sleep("nap", "20ms").await?;
                    let after: i64 = step.run("s2", || async { Ok(7i64) }).await?;
                    Ok(json!(after))
                })
            }),
        );

        let client = WorkflowClientBuilder::new()
            .define_workflow(definition.clone())
            .expect("register workflow")
            .build(namespace_id, Arc::clone(&backend));

        let mut definitions = std::collections::HashMap::new();
        definitions.insert(definition.name().to_owned(), definition);

        let mut settings = WorkerSettings::new("worker-1");
        settings.poll_timeout = Duration::from_millis(20);
        let worker = Worker::new(namespace_id, Arc::clone(&backend), Arc::new(definitions), settings);

        let handle = client.run("napper", json!({})).await.expect("enqueue run");

        // Without releasing the lease on suspend, the run would stay claimed
        // by `worker-1` until its 30s lease expired, never resuming within
        // this test's 2s timeout.
        let worker_task = tokio::spawn(async move { worker.run().await });
        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .expect("worker drives the sleeping run to completion across two claims")
            .expect("run succeeds");
        worker_task.abort();

        assert_eq!(result, json!(7));

        let run = backend
            .get_run(namespace_id, handle.id())
            .await
            .expect("get run")
            .expect("run exists");
        assert_eq!(run.status(), stepwise_domain::WorkflowRunStatus::Completed);
    }

    #[tokio::test]
    async fn step_failure_end_to_end_rejects_the_handle() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        let namespace_id = NamespaceId::new();

        let definition = WorkflowDefinition::new(
            "boom",
            Arc::new(|ctx: crate::runtime::WorkflowContext| -> crate::runtime::StepFuture {
                Box::pin(async move {
                    let step = ctx.step();
                    let _: Value = step
                        .run("boom", || async {
                            Err(stepwise_core::AppError::StepFailed("kaboom".to_owned()))
                        })
                        .await?;
                    Ok(Value::Null)
                })
            }),
        );

        let client = WorkflowClientBuilder::new()
            .define_workflow(definition.clone())
            .expect("register workflow")
            .build(namespace_id, Arc::clone(&backend));

        let mut definitions = std::collections::HashMap::new();
        definitions.insert(definition.name().to_owned(), definition);
        let worker = Worker::new(
            namespace_id,
            Arc::clone(&backend),
            Arc::new(definitions),
            WorkerSettings::new("worker-1"),
        );

        let handle = client.run("boom", json!({})).await.expect("enqueue run");
        let worker_task = tokio::spawn(async move { worker.run().await });
        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .expect("worker settles the run");
        worker_task.abort();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn backend_conformance_suite_passes_against_the_fake_backend() {
        let backend: Arc<dyn crate::ports::Backend> = Arc::new(FakeBackend::new());
        conformance::two_step_success_and_fifo_admission(Arc::clone(&backend)).await;
        conformance::concurrent_claim_race(Arc::clone(&backend), 16).await;
        conformance::step_failure_fails_the_run(Arc::clone(&backend)).await;
        conformance::lease_expiry_reclaim(Arc::clone(&backend)).await;
        conformance::at_most_one_completed_attempt_per_step(backend).await;
    }
}
