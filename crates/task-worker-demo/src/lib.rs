//! Task worker demo service.
//!
//! A small binary wiring `task-worker-config::init_tracing`, a handful of
//! demo task handlers (including the `add` task from the simple-success
//! scenario), and a `Worker` built from either the in-memory reference
//! ports or a Redis-backed broker/backend pair when `REDIS_URL` is set.
//!
//! Grounded in the teacher's `apps/zerg/tasks-worker::run()`, kept the
//! overall shape (init tracing, connect, build worker, launch, log exit)
//! and the `Environment`-driven tracing setup, replaced the
//! Postgres/domain-specific wiring (not applicable here) with
//! `task-worker`'s own ports.

use std::sync::Arc;

use eyre::{Result, WrapErr};
use task_worker::backend::InMemoryBackend;
use task_worker::broker::in_memory::InMemoryBroker;
use task_worker::config::WorkerConfig;
use task_worker::runtime::TaskRegistry;
use task_worker::signature::Arg;
use task_worker::worker::{WorkerBuilder, WorkerExit};
use task_worker::{Backend, Broker};
use task_worker_config::{tracing::init_tracing, Environment};
use tracing::{error, info};

fn register_demo_tasks(registry: &mut TaskRegistry) {
    registry.register("add", Some(2), |args: Vec<Arg>| async move {
        let a = args[0]
            .value
            .as_i64()
            .ok_or_else(|| task_worker::WorkerError::TaskInvocation("arg 0 is not an int".into()))?;
        let b = args[1]
            .value
            .as_i64()
            .ok_or_else(|| task_worker::WorkerError::TaskInvocation("arg 1 is not an int".into()))?;
        Ok(vec![Arg::i64(a + b)])
    });

    registry.register("notify", None, |args: Vec<Arg>| async move {
        info!(?args, "notify task invoked");
        Ok(vec![])
    });
}

/// Builds the broker + backend pair. Uses Redis Streams when `REDIS_URL`
/// is set and the `redis-backend` feature is enabled; otherwise falls
/// back to the in-memory reference ports, which is enough to exercise the
/// full pipeline end to end without any external dependency.
async fn build_ports() -> Result<(Arc<dyn Broker>, Arc<dyn Backend>)> {
    #[cfg(feature = "redis-backend")]
    {
        if let Ok(redis_url) = std::env::var("REDIS_URL") {
            info!(%redis_url, "connecting to Redis");
            let client =
                redis::Client::open(redis_url.clone()).wrap_err("invalid REDIS_URL")?;
            let conn_manager = client
                .get_connection_manager()
                .await
                .wrap_err("failed to connect to Redis")?;

            let broker = task_worker::broker::redis_stream::RedisStreamBroker::new(
                conn_manager.clone(),
                "task-worker:demo",
                "task-worker:demo:workers",
                format!("worker-{}", uuid::Uuid::new_v4()),
            );
            let backend = task_worker::backend::redis_backend::RedisBackend::new(
                conn_manager,
                "task-worker:demo",
            );
            return Ok((Arc::new(broker), Arc::new(backend)));
        }
    }

    info!("REDIS_URL not set (or redis-backend feature disabled); using in-memory ports");
    Ok((
        Arc::new(InMemoryBroker::new()),
        Arc::new(InMemoryBackend::new()),
    ))
}

/// Runs the demo worker. Blocks until the worker exits (via SIGINT/SIGTERM
/// escalation or a fatal broker error).
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    init_tracing(&environment);

    info!(environment = ?environment, "starting task worker demo");

    let (broker, backend) = build_ports().await?;

    let mut registry = TaskRegistry::new();
    register_demo_tasks(&mut registry);

    let queue_name = std::env::var("TASK_WORKER_QUEUE").unwrap_or_else(|_| "celery".to_string());
    let config = WorkerConfig::new(
        std::env::var("BROKER_URL").unwrap_or_else(|_| "memory://".to_string()),
        std::env::var("BACKEND_URL").unwrap_or_else(|_| "memory://".to_string()),
    )
    .with_queue_name(queue_name)
    .with_concurrency(
        std::env::var("TASK_WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4),
    );

    let worker = WorkerBuilder::new(config, Arc::new(registry), backend, broker)
        .error_handler(|sig, message| {
            error!(uuid = %sig.uuid, name = %sig.name, error = %message, "task failed");
        })
        .broker_error_handler(|err| {
            error!(error = %err, "broker reported a transient error");
        })
        .build();

    match worker.launch().await {
        WorkerExit::QuitGraceful => {
            info!("worker quit gracefully");
            Ok(())
        }
        WorkerExit::QuitAbrupt => {
            info!("worker quit abruptly");
            Ok(())
        }
        WorkerExit::BrokerTerminated(err) => {
            Err(err).wrap_err("broker terminated the worker")
        }
    }
}
