//! Concrete `Backend` implementations: an embedded SQLite store and a
//! server-based Postgres store, both conforming to
//! `stepwise_application::ports::Backend` identically in observable
//! behaviour.

#![forbid(unsafe_code)]

pub mod postgres_backend;
pub mod sqlite_backend;

pub use postgres_backend::PostgresBackend;
pub use sqlite_backend::SqliteBackend;

#[cfg(test)]
mod conformance_tests {
    use std::sync::Arc;

    use stepwise_application::conformance;
    use stepwise_application::ports::Backend;

    use crate::sqlite_backend::SqliteBackend;

    async fn in_memory_backend() -> Arc<dyn Backend> {
        Arc::new(
            SqliteBackend::connect("sqlite::memory:")
                .await
                .expect("in-memory sqlite backend connects and migrates"),
        )
    }

    #[tokio::test]
    async fn sqlite_two_step_success_and_fifo_admission() {
        conformance::two_step_success_and_fifo_admission(in_memory_backend().await).await;
    }

    #[tokio::test]
    async fn sqlite_concurrent_claim_race() {
        conformance::concurrent_claim_race(in_memory_backend().await, 8).await;
    }

    #[tokio::test]
    async fn sqlite_step_failure_fails_the_run() {
        conformance::step_failure_fails_the_run(in_memory_backend().await).await;
    }

    #[tokio::test]
    async fn sqlite_lease_expiry_reclaim() {
        conformance::lease_expiry_reclaim(in_memory_backend().await).await;
    }

    #[tokio::test]
    async fn sqlite_at_most_one_completed_attempt_per_step() {
        conformance::at_most_one_completed_attempt_per_step(in_memory_backend().await).await;
    }

    /// Runs the same suite against a real Postgres instance when
    /// `DATABASE_URL` is set; skipped (not failed) otherwise, since CI and
    /// most dev machines don't carry a running Postgres.
    async fn postgres_backend_from_env() -> Option<Arc<dyn Backend>> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let backend = crate::postgres_backend::PostgresBackend::connect(&database_url)
            .await
            .expect("DATABASE_URL backend connects and migrates");
        Some(Arc::new(backend))
    }

    #[tokio::test]
    async fn postgres_two_step_success_and_fifo_admission() {
        let Some(backend) = postgres_backend_from_env().await else {
            return;
        };
        conformance::two_step_success_and_fifo_admission(backend).await;
    }

    #[tokio::test]
    async fn postgres_at_most_one_completed_attempt_per_step() {
        let Some(backend) = postgres_backend_from_env().await else {
            return;
        };
        conformance::at_most_one_completed_attempt_per_step(backend).await;
    }
}
