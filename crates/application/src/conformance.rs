//! A conformance suite expressed once, generically over `Arc<dyn Backend>`.
//!
//! Exercised by this crate's own tests against [`crate::testing::FakeBackend`]
//! and reused, unchanged, by `stepwise-infrastructure`'s tests against
//! `SqliteBackend` and (when `DATABASE_URL` is set) `PostgresBackend`. Every
//! assertion here corresponds to one of the literal end-to-end scenarios or
//! invariants in the design notes; keep this file free of backend-specific
//! code so "passes conformance" means the same thing everywhere.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use stepwise_core::NamespaceId;

use crate::ports::Backend;

/// *Two-step success* and *FIFO admission*: enqueue two runs, claim the
/// older first, drive one run through two steps to completion.
pub async fn two_step_success_and_fifo_admission(backend: Arc<dyn Backend>) {
    let namespace_id = NamespaceId::new();

    let first_run = backend
        .enqueue_run(namespace_id, "two-step", json!({}), None)
        .await
        .expect("enqueue first run");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second_run = backend
        .enqueue_run(namespace_id, "two-step", json!({}), None)
        .await
        .expect("enqueue second run");

    let claim = backend
        .claim_run(namespace_id, "worker-1", 30_000)
        .await
        .expect("claim call")
        .expect("a run is claimable");
    assert_eq!(claim.run_id, first_run, "FIFO admission: older run claimed first");

    let attempt_a = backend
        .start_step_attempt(
            namespace_id,
            &claim.run_id,
            "worker-1",
            "a",
            stepwise_domain::StepKind::Function,
            json!({}),
            json!(null),
        )
        .await
        .expect("start step a");
    backend
        .complete_step_attempt(namespace_id, &attempt_a, "worker-1", json!(1))
        .await
        .expect("complete step a");

    let attempt_b = backend
        .start_step_attempt(
            namespace_id,
            &claim.run_id,
            "worker-1",
            "b",
            stepwise_domain::StepKind::Function,
            json!({}),
            json!(null),
        )
        .await
        .expect("start step b");
    backend
        .complete_step_attempt(namespace_id, &attempt_b, "worker-1", json!(3))
        .await
        .expect("complete step b");

    backend
        .mark_run_succeeded(namespace_id, &claim.run_id, "worker-1", json!(3))
        .await
        .expect("mark run succeeded");

    let attempts = backend
        .list_attempts(namespace_id, &claim.run_id)
        .await
        .expect("list attempts");
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|attempt| attempt.status() == stepwise_domain::StepAttemptStatus::Completed));

    let second_claim = backend
        .claim_run(namespace_id, "worker-2", 30_000)
        .await
        .expect("claim call")
        .expect("second run is claimable");
    assert_eq!(second_claim.run_id, second_run);
}

/// *At-most-one leaseholder* / *Concurrent claim race*: N simultaneous
/// claimants against one run, exactly one succeeds.
pub async fn concurrent_claim_race(backend: Arc<dyn Backend>, worker_count: usize) {
    let namespace_id = NamespaceId::new();
    backend
        .enqueue_run(namespace_id, "race", json!({}), None)
        .await
        .expect("enqueue run");

    let mut handles = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
        let backend = Arc::clone(&backend);
        handles.push(tokio::spawn(async move {
            backend
                .claim_run(namespace_id, &format!("worker-{index}"), 30_000)
                .await
                .expect("claim call")
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.expect("task join").is_some() {
            successes += 1;
        }
    }

    assert_eq!(successes, 1, "exactly one worker should win the claim race");
}

/// *Step failure*: a failing step fails the attempt and the run, and the
/// error is recorded in the run's `error` field.
pub async fn step_failure_fails_the_run(backend: Arc<dyn Backend>) {
    let namespace_id = NamespaceId::new();
    let run_id = backend
        .enqueue_run(namespace_id, "boom", json!({}), None)
        .await
        .expect("enqueue run");
    let claim = backend
        .claim_run(namespace_id, "worker-1", 30_000)
        .await
        .expect("claim call")
        .expect("claimable");

    let attempt_id = backend
        .start_step_attempt(
            namespace_id,
            &claim.run_id,
            "worker-1",
            "boom",
            stepwise_domain::StepKind::Function,
            json!({}),
            json!(null),
        )
        .await
        .expect("start step");

    let error = json!({ "name": "Error", "message": "kaboom" });
    backend
        .fail_step_attempt(namespace_id, &attempt_id, "worker-1", error.clone())
        .await
        .expect("fail step attempt");
    backend
        .mark_run_failed(namespace_id, &run_id, "worker-1", error.clone())
        .await
        .expect("mark run failed");

    let attempts = backend.list_attempts(namespace_id, &run_id).await.expect("list attempts");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status(), stepwise_domain::StepAttemptStatus::Failed);
    assert_eq!(attempts[0].error(), Some(&error));
}

/// *Lease expiry reclaim*: a run whose worker disappears is claimable again
/// once `sweep_expired_leases` runs past its lease.
pub async fn lease_expiry_reclaim(backend: Arc<dyn Backend>) {
    let namespace_id = NamespaceId::new();
    backend
        .enqueue_run(namespace_id, "abandoned", json!({}), None)
        .await
        .expect("enqueue run");

    let claim = backend
        .claim_run(namespace_id, "worker-1", 1)
        .await
        .expect("claim call")
        .expect("claimable");

    tokio::time::sleep(Duration::from_millis(20)).await;

    let reclaimed = backend
        .sweep_expired_leases(namespace_id, Utc::now())
        .await
        .expect("sweep expired leases");
    assert_eq!(reclaimed, 1);

    let second_claim = backend
        .claim_run(namespace_id, "worker-2", 30_000)
        .await
        .expect("claim call")
        .expect("claimable again after sweep");
    assert_eq!(second_claim.run_id, claim.run_id);
}

/// *At-most-one success per step*: starting a second attempt for a step
/// that already has a completed attempt is rejected.
pub async fn at_most_one_completed_attempt_per_step(backend: Arc<dyn Backend>) {
    let namespace_id = NamespaceId::new();
    let run_id = backend
        .enqueue_run(namespace_id, "dup-step", json!({}), None)
        .await
        .expect("enqueue run");
    let claim = backend
        .claim_run(namespace_id, "worker-1", 30_000)
        .await
        .expect("claim call")
        .expect("claimable");

    let attempt_id = backend
        .start_step_attempt(
            namespace_id,
            &claim.run_id,
            "worker-1",
            "once",
            stepwise_domain::StepKind::Function,
            json!({}),
            json!(null),
        )
        .await
        .expect("start step");
    backend
        .complete_step_attempt(namespace_id, &attempt_id, "worker-1", json!(1))
        .await
        .expect("complete step");

    let second_attempt = backend
        .start_step_attempt(
            namespace_id,
            &run_id,
            "worker-1",
            "once",
            stepwise_domain::StepKind::Function,
            json!({}),
            json!(null),
        )
        .await;
    assert!(second_attempt.is_err(), "a second attempt for a completed step must be rejected");
}
