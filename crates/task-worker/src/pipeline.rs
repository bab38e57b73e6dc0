//! The per-delivery task pipeline: registry check, state transitions,
//! hooks, invocation, and outcome classification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::Instrument;

use crate::backend::Backend;
use crate::callbacks;
use crate::error::WorkerError;
use crate::metrics::{self, MetricsTimer, TaskStatus};
use crate::runtime::TaskRuntime;
use crate::signature::Signature;
use crate::worker::WorkerHooks;

/// The hard-coupled collaborators a `process` call needs: the registry
/// that knows how to invoke a task, the backend that records its state,
/// the broker that re-submits retries and callbacks, and the read-only
/// hook slots installed at worker build time.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) runtime: Arc<dyn TaskRuntime>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) submitter: callbacks::Submitter,
    pub(crate) hooks: Arc<WorkerHooks>,
    /// Shared across every clone of this `Pipeline` (one per `Worker`), so
    /// concurrently executing deliveries all `fetch_add`/`fetch_sub` the
    /// same counter instead of racing independent 1.0/0.0 gauge sets.
    in_flight: Arc<AtomicUsize>,
}

impl Pipeline {
    pub fn new(
        runtime: Arc<dyn TaskRuntime>,
        backend: Arc<dyn Backend>,
        submitter: callbacks::Submitter,
        hooks: Arc<WorkerHooks>,
    ) -> Self {
        Self {
            runtime,
            backend,
            submitter,
            hooks,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Process a single delivery. Reentrant: holds no `&mut self` state,
    /// so it is safe to call concurrently for many in-flight deliveries.
    pub async fn process(&self, mut sig: Signature) -> Result<(), WorkerError> {
        let span = tracing::info_span!(
            "process_task",
            uuid = %sig.uuid,
            name = %sig.name,
            trace_headers = ?sig.headers,
        );
        self.process_inner(&mut sig).instrument(span).await
    }

    async fn process_inner(&self, sig: &mut Signature) -> Result<(), WorkerError> {
        // Step 1: registry check. A fleet of workers may have disjoint
        // task registries; an unknown name is not an error, it belongs to
        // some other worker.
        if !self.runtime.is_registered(&sig.name) {
            tracing::debug!(uuid = %sig.uuid, name = %sig.name, "task not registered here, skipping");
            metrics::record_task_processed(&sig.name, TaskStatus::Unknown);
            return Ok(());
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_in_flight_tasks(current as f64);
        let result = self.run_registered(sig).await;
        let current = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_in_flight_tasks(current as f64);
        result
    }

    async fn run_registered(&self, sig: &mut Signature) -> Result<(), WorkerError> {
        // Step 2: state -> Received. Fatal to this delivery.
        self.backend
            .set_state_received(sig)
            .await
            .map_err(|e| WorkerError::backend(&sig.uuid, e))?;

        // Step 3: task materialization / argument binding.
        if let Err(binding_err) = self.runtime.bind(&sig.name, &sig.args) {
            return self.task_failed(sig, binding_err.to_string()).await;
        }

        // Step 5: state -> Started.
        self.backend
            .set_state_started(sig)
            .await
            .map_err(|e| WorkerError::backend(&sig.uuid, e))?;

        // Step 6: pre-task hook.
        if let Some(pre) = &self.hooks.pre_task {
            pre(sig);
        }

        // Step 8: invoke. Step 7 (post-task hook) runs on every exit path,
        // so it wraps the call rather than following step 6 directly.
        let task_timer = MetricsTimer::new(&sig.name);
        let outcome = self.runtime.invoke(&sig.name, sig.args.clone()).await;
        if let Some(post) = &self.hooks.post_task {
            post(sig, &outcome);
        }
        // Records on drop; stop() here just makes the record point explicit
        // (right after invocation, not whenever the timer happens to fall
        // out of scope).
        task_timer.stop();

        // Step 9: classify outcome.
        match outcome {
            Ok(results) => self.task_succeeded(sig, results).await,
            Err(WorkerError::RetryRequested(retry_in)) => self.retry_task_in(sig, retry_in).await,
            Err(_) if sig.retry_count > 0 => self.task_retry(sig).await,
            Err(err) => self.task_failed(sig, err.to_string()).await,
        }
    }

    async fn task_succeeded(
        &self,
        sig: &mut Signature,
        results: Vec<crate::signature::TaskResult>,
    ) -> Result<(), WorkerError> {
        metrics::record_task_processed(&sig.name, TaskStatus::Success);
        callbacks::task_succeeded(&self.backend, &self.submitter, sig, results).await
    }

    async fn task_failed(&self, sig: &mut Signature, message: String) -> Result<(), WorkerError> {
        metrics::record_task_processed(&sig.name, TaskStatus::Failure);
        if let Some(handler) = &self.hooks.error_handler {
            handler(sig, &message);
        } else {
            tracing::error!(uuid = %sig.uuid, name = %sig.name, error = %message, "task failed");
        }
        callbacks::task_failed(&self.backend, &self.submitter, sig, &message).await
    }

    async fn task_retry(&self, sig: &mut Signature) -> Result<(), WorkerError> {
        metrics::record_task_processed(&sig.name, TaskStatus::Retry);
        metrics::record_retry(&sig.name);
        callbacks::task_retry(&self.backend, &self.submitter, sig).await
    }

    async fn retry_task_in(
        &self,
        sig: &mut Signature,
        retry_in: std::time::Duration,
    ) -> Result<(), WorkerError> {
        metrics::record_task_processed(&sig.name, TaskStatus::Retry);
        metrics::record_retry(&sig.name);
        callbacks::retry_task_in(&self.backend, &self.submitter, sig, retry_in).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::broker::in_memory::InMemoryBroker;
    use crate::runtime::TaskRegistry;
    use crate::signature::Arg;

    fn pipeline(registry: TaskRegistry) -> (Pipeline, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let submitter: callbacks::Submitter = Arc::new(InMemoryBroker::new());
        let pipeline = Pipeline::new(
            Arc::new(registry),
            Arc::clone(&backend) as Arc<dyn Backend>,
            submitter,
            Arc::new(WorkerHooks::default()),
        );
        (pipeline, backend)
    }

    #[tokio::test]
    async fn unregistered_task_is_skipped_without_touching_backend_state() {
        // A fleet of workers may have disjoint task registries; a name
        // this worker doesn't know belongs to some other worker and must
        // not be recorded as having run here at all.
        let (pipeline, backend) = pipeline(TaskRegistry::new());
        let sig = Signature::new("u1", "some_other_workers_task", vec![]);

        pipeline.process(sig).await.unwrap();

        assert_eq!(backend.task_state("u1").await, None);
    }

    #[tokio::test]
    async fn registered_task_runs_to_success() {
        let mut registry = TaskRegistry::new();
        registry.register("add", Some(2), |args: Vec<Arg>| async move {
            let a = args[0].value.as_i64().unwrap();
            let b = args[1].value.as_i64().unwrap();
            Ok(vec![Arg::i64(a + b)])
        });
        let (pipeline, backend) = pipeline(registry);
        let sig = Signature::new("u2", "add", vec![Arg::i64(2), Arg::i64(3)]);

        pipeline.process(sig).await.unwrap();

        assert_eq!(
            backend.task_state("u2").await,
            Some(crate::signature::TaskState::Success)
        );
    }
}
