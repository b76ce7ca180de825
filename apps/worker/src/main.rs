//! stepwise workflow worker runtime.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use stepwise_application::ports::Backend;
use stepwise_application::{Worker, WorkerSettings, WorkflowDefinition};
use stepwise_core::{AppError, AppResult, NamespaceId};
use stepwise_infrastructure::{PostgresBackend, SqliteBackend};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    namespace_id: NamespaceId,
    worker_id: String,
    concurrency: usize,
    lease_seconds: u64,
    poll_interval_ms: u64,
    sweep_interval_secs: u64,
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let backend = connect_backend(&config.database_url).await?;

    info!(
        worker_id = %config.worker_id,
        namespace_id = %config.namespace_id,
        concurrency = config.concurrency,
        lease_seconds = config.lease_seconds,
        poll_interval_ms = config.poll_interval_ms,
        "stepwise-worker started"
    );

    // Workflow registration is the embedding application's responsibility;
    // this process hosts the claim/execute/heartbeat loop against whatever
    // definitions it is handed.
    let definitions: Arc<HashMap<String, WorkflowDefinition>> = Arc::new(register_workflows());

    let mut settings = WorkerSettings::new(config.worker_id.clone());
    settings.concurrency = config.concurrency;
    settings.lease_duration_ms = config.lease_seconds * 1_000;
    settings.poll_timeout = Duration::from_millis(config.poll_interval_ms);
    settings.sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    settings.shutdown_grace_period = Duration::from_secs(config.shutdown_grace_secs);

    let worker = Arc::new(Worker::new(config.namespace_id, backend, definitions, settings));

    let shutdown_worker = Arc::clone(&worker);
    let run_task = tokio::spawn(async move { shutdown_worker.run().await });

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| AppError::Internal(format!("failed to install ctrl-c handler: {error}")))?;

    info!("shutdown requested, draining in-flight runs");
    worker.stop();
    run_task
        .await
        .map_err(|error| AppError::Internal(format!("worker task join failed: {error}")))?;

    Ok(())
}

/// Returns the workflow definitions this process should claim and execute.
/// Empty by default: user-authored workflow code is wired in by the
/// embedding application, not by this binary.
fn register_workflows() -> HashMap<String, WorkflowDefinition> {
    HashMap::new()
}

async fn connect_backend(database_url: &str) -> AppResult<Arc<dyn Backend>> {
    if database_url.starts_with("sqlite:") {
        let backend = SqliteBackend::connect(database_url).await?;
        return Ok(Arc::new(backend));
    }

    if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
        let backend = PostgresBackend::connect(database_url).await?;
        return Ok(Arc::new(backend));
    }

    Err(AppError::Validation(format!(
        "DATABASE_URL scheme not recognised (expected sqlite: or postgres:): '{database_url}'"
    )))
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let namespace_id = match env::var("NAMESPACE_ID") {
            Ok(value) => {
                let uuid = Uuid::parse_str(value.trim())
                    .map_err(|error| AppError::Validation(format!("invalid NAMESPACE_ID '{value}': {error}")))?;
                NamespaceId::from_uuid(uuid)
            }
            Err(_) => {
                warn!("NAMESPACE_ID not set; generating a random namespace for this process");
                NamespaceId::new()
            }
        };
        let worker_id = env::var("WORKER_ID")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));

        let concurrency = parse_env_usize("WORKER_CONCURRENCY", 10)?;
        let lease_seconds = parse_env_u64("WORKER_LEASE_SECONDS", 30)?;
        let poll_interval_ms = parse_env_u64("WORKER_POLL_INTERVAL_MS", 2_000)?;
        let sweep_interval_secs = parse_env_u64("WORKER_SWEEP_INTERVAL_SECS", 10)?;
        let shutdown_grace_secs = parse_env_u64("WORKER_SHUTDOWN_GRACE_SECS", 30)?;

        if concurrency == 0 {
            return Err(AppError::Validation("WORKER_CONCURRENCY must be greater than zero".to_owned()));
        }
        if lease_seconds == 0 {
            return Err(AppError::Validation("WORKER_LEASE_SECONDS must be greater than zero".to_owned()));
        }

        Ok(Self {
            database_url,
            namespace_id,
            worker_id,
            concurrency,
            lease_seconds,
            poll_interval_ms,
            sweep_interval_secs,
            shutdown_grace_secs,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_usize(name: &str, default: usize) -> AppResult<usize> {
    match env::var(name) {
        Ok(value) => value
            .parse::<usize>()
            .map_err(|error| AppError::Validation(format!("invalid {name} value '{value}': {error}"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map_err(|error| AppError::Validation(format!("invalid {name} value '{value}': {error}"))),
        Err(_) => Ok(default),
    }
}
