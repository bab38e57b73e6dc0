//! The callback orchestration engine: retry re-submission, on-success/
//! on-error fan-out, group-completion detection, and exactly-once chord
//! triggering.
//!
//! Fan-out submission runs concurrently via `futures::future::join_all`;
//! every result is collected so one failing submission doesn't silently
//! swallow the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use crate::backend::Backend;
use crate::broker::Broker;
use crate::error::WorkerError;
use crate::metrics;
use crate::retry;
use crate::signature::{Signature, TaskResult};

/// The callback engine's only way of getting a signature back onto the
/// wire: the broker this worker is already attached to. A type alias
/// rather than a new trait, since re-submission is just `Broker::publish`.
pub type Submitter = Arc<dyn Broker>;

/// The success path. Transitions state, fans out `on_success`, and (if
/// this signature closes out a group) attempts the chord.
pub async fn task_succeeded(
    backend: &Arc<dyn Backend>,
    submitter: &Submitter,
    sig: &mut Signature,
    results: Vec<TaskResult>,
) -> Result<(), WorkerError> {
    backend
        .set_state_success(sig, &results)
        .await
        .map_err(|e| WorkerError::backend(&sig.uuid, e))?;

    fan_out_on_success(submitter, sig, &results).await?;

    if let Some(group_uuid) = sig.group_uuid.clone() {
        maybe_trigger_chord(backend, submitter, &group_uuid, sig.group_task_count.unwrap_or(0))
            .await?;
    }

    Ok(())
}

async fn fan_out_on_success(
    submitter: &Submitter,
    sig: &Signature,
    results: &[TaskResult],
) -> Result<(), WorkerError> {
    if sig.on_success.is_empty() {
        return Ok(());
    }

    let submissions = sig.on_success.iter().cloned().map(|mut child| {
        if !sig.immutable {
            child.extend_args_with_results(results);
        }
        let submitter = Arc::clone(submitter);
        async move {
            submitter
                .publish(&child)
                .await
                .map_err(|e| WorkerError::CallbackSubmission(e.to_string()))
        }
    });

    join_all(submissions)
        .await
        .into_iter()
        .collect::<Result<Vec<()>, _>>()?;
    Ok(())
}

/// Checks group completion and, for the single winner of the chord race,
/// assembles and submits the chord callback.
async fn maybe_trigger_chord(
    backend: &Arc<dyn Backend>,
    submitter: &Submitter,
    group_uuid: &str,
    group_task_count: usize,
) -> Result<(), WorkerError> {
    let completed = backend
        .group_completed(group_uuid, group_task_count)
        .await
        .map_err(|e| WorkerError::backend(group_uuid, e))?;
    if !completed {
        return Ok(());
    }

    let states = backend
        .group_task_states(group_uuid, group_task_count)
        .await
        .map_err(|e| WorkerError::backend(group_uuid, e))?;

    let chord_callback = states
        .iter()
        .find_map(|(member, _, _)| member.chord_callback.clone());
    let Some(mut chord_callback) = chord_callback else {
        return Ok(());
    };

    // Atomic, cluster-wide single-winner claim. Losers stop here; this is
    // the one invariant the worker layer must never try to derive itself.
    let won = backend
        .trigger_chord(group_uuid)
        .await
        .map_err(|e| WorkerError::backend(group_uuid, e))?;
    if !won {
        return Ok(());
    }

    // If any member did not succeed the chord is silently abandoned (see
    // DESIGN.md), but logged so the cluster-wide silence is at least
    // observable.
    if !states.iter().all(|(_, state, _)| *state == crate::signature::TaskState::Success) {
        tracing::warn!(
            group_uuid,
            "group completed but not all members succeeded; abandoning chord"
        );
        return Ok(());
    }

    if !chord_callback.immutable {
        for (_, _, results) in &states {
            chord_callback.extend_args_with_results(results);
        }
    }

    submitter
        .publish(&chord_callback)
        .await
        .map_err(|e| WorkerError::CallbackSubmission(e.to_string()))?;
    metrics::record_chord_triggered(group_uuid);
    backend
        .purge_group_meta(group_uuid)
        .await
        .map_err(|e| WorkerError::backend(group_uuid, e))?;
    Ok(())
}

/// Spec §4.5: the failure path. Transitions state, then fans out
/// `on_error` with the error message prepended as argument 0.
pub async fn task_failed(
    backend: &Arc<dyn Backend>,
    submitter: &Submitter,
    sig: &mut Signature,
    message: &str,
) -> Result<(), WorkerError> {
    backend
        .set_state_failure(sig, message)
        .await
        .map_err(|e| WorkerError::backend(&sig.uuid, e))?;

    let submissions = sig.on_error.iter().cloned().map(|mut child| {
        child.prepend_error_arg(message);
        let submitter = Arc::clone(submitter);
        async move {
            submitter
                .publish(&child)
                .await
                .map_err(|e| WorkerError::CallbackSubmission(e.to_string()))
        }
    });

    join_all(submissions)
        .await
        .into_iter()
        .collect::<Result<Vec<()>, _>>()?;
    Ok(())
}

/// Spec §4.3.a: implicit retry. The decremented `retry_count` and the
/// Fibonacci-advanced `retry_timeout` are the bookkeeping that survives
/// across retries of the *same* `uuid`, since the retry is not a new task.
pub async fn task_retry(
    backend: &Arc<dyn Backend>,
    submitter: &Submitter,
    sig: &mut Signature,
) -> Result<(), WorkerError> {
    backend
        .set_state_retry(sig)
        .await
        .map_err(|e| WorkerError::backend(&sig.uuid, e))?;

    sig.retry_count = sig.retry_count.saturating_sub(1);
    let (prev, timeout) = retry::advance(sig.retry_timeout_prev, sig.retry_timeout);
    sig.retry_timeout_prev = prev;
    sig.retry_timeout = timeout;
    sig.eta = Some(Utc::now() + chrono::Duration::seconds(timeout as i64));

    submitter
        .publish(sig)
        .await
        .map_err(|e| WorkerError::CallbackSubmission(e.to_string()))
}

/// Spec §4.3.b: explicit retry-in. `retry_count`/`retry_timeout` are left
/// untouched, since the task author has taken control of the backoff.
pub async fn retry_task_in(
    backend: &Arc<dyn Backend>,
    submitter: &Submitter,
    sig: &mut Signature,
    retry_in: Duration,
) -> Result<(), WorkerError> {
    backend
        .set_state_retry(sig)
        .await
        .map_err(|e| WorkerError::backend(&sig.uuid, e))?;

    sig.eta = Some(Utc::now() + chrono::Duration::from_std(retry_in).unwrap_or_default());

    submitter
        .publish(sig)
        .await
        .map_err(|e| WorkerError::CallbackSubmission(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::broker::in_memory::InMemoryBroker;
    use crate::signature::{Arg, ArgType};

    fn backend() -> Arc<dyn Backend> {
        Arc::new(InMemoryBackend::new())
    }

    fn submitter() -> Submitter {
        Arc::new(InMemoryBroker::new())
    }

    #[tokio::test]
    async fn on_success_fan_out_appends_results_when_mutable() {
        let backend = backend();
        let submitter = submitter();
        let child = Signature::new("child", "notify", vec![Arg::i64(1)]);
        let mut parent = Signature::new("parent", "add", vec![]);
        parent.on_success = vec![child];

        task_succeeded(&backend, &submitter, &mut parent, vec![Arg::i64(7)])
            .await
            .unwrap();

        let delivered = submitter.read_new(10, None).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.args.len(), 2);
        assert_eq!(delivered[0].1.args[1].value, serde_json::Value::from(7));
    }

    #[tokio::test]
    async fn on_success_fan_out_skips_augmentation_when_immutable() {
        let backend = backend();
        let submitter = submitter();
        let child = Signature::new("child", "notify", vec![Arg::i64(1)]);
        let mut parent = Signature::new("parent", "add", vec![]);
        parent.immutable = true;
        parent.on_success = vec![child];

        task_succeeded(&backend, &submitter, &mut parent, vec![Arg::i64(7)])
            .await
            .unwrap();

        let delivered = submitter.read_new(10, None).await.unwrap();
        assert_eq!(delivered[0].1.args.len(), 1);
    }

    #[tokio::test]
    async fn on_error_fan_out_prepends_error_message() {
        let backend = backend();
        let submitter = submitter();
        let child = Signature::new("child", "notify", vec![Arg::i64(1)]);
        let mut parent = Signature::new("parent", "add", vec![]);
        parent.on_error = vec![child];

        task_failed(&backend, &submitter, &mut parent, "boom")
            .await
            .unwrap();

        let delivered = submitter.read_new(10, None).await.unwrap();
        assert_eq!(delivered[0].1.args[0].arg_type, ArgType::String);
        assert_eq!(
            delivered[0].1.args[0].value,
            serde_json::Value::String("boom".into())
        );
    }

    #[tokio::test]
    async fn implicit_retry_decrements_count_and_advances_timeout() {
        let backend = backend();
        let submitter = submitter();
        let mut sig = Signature::new("u1", "flaky", vec![]);
        sig.retry_count = 3;
        sig.retry_timeout = 1;

        task_retry(&backend, &submitter, &mut sig).await.unwrap();
        assert_eq!(sig.retry_count, 2);
        assert_eq!(sig.retry_timeout, 1);

        task_retry(&backend, &submitter, &mut sig).await.unwrap();
        assert_eq!(sig.retry_count, 1);
        assert_eq!(sig.retry_timeout, 2);

        task_retry(&backend, &submitter, &mut sig).await.unwrap();
        assert_eq!(sig.retry_count, 0);
        assert_eq!(sig.retry_timeout, 3);

        let delivered = submitter.read_new(10, None).await.unwrap();
        assert_eq!(delivered.len(), 3);
    }

    #[tokio::test]
    async fn explicit_retry_leaves_count_and_timeout_untouched() {
        let backend = backend();
        let submitter = submitter();
        let mut sig = Signature::new("u1", "flaky", vec![]);
        sig.retry_count = 3;
        sig.retry_timeout = 1;

        retry_task_in(&backend, &submitter, &mut sig, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(sig.retry_count, 3);
        assert_eq!(sig.retry_timeout, 1);
        assert!(sig.eta.is_some());
    }

    #[tokio::test]
    async fn chord_fires_exactly_once_across_concurrent_winners() {
        let backend: Arc<dyn Backend> = backend();
        let submitter = submitter();

        let chord = Signature::new("chord", "collect", vec![]);
        let mut handles = Vec::new();
        for n in 0..3u32 {
            let mut member = Signature::new(format!("m{n}"), "member", vec![]);
            member.group_uuid = Some("g1".into());
            member.group_task_count = Some(3);
            member.chord_callback = Some(Box::new(chord.clone()));
            let results = vec![Arg::i64(n as i64)];

            let backend = Arc::clone(&backend);
            let submitter = Arc::clone(&submitter);
            handles.push(tokio::spawn(async move {
                task_succeeded(&backend, &submitter, &mut member, results)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let delivered = submitter.read_new(10, None).await.unwrap();
        let chord_deliveries: Vec<_> = delivered
            .iter()
            .filter(|(_, sig)| sig.uuid == "chord")
            .collect();
        assert_eq!(chord_deliveries.len(), 1);
        assert_eq!(chord_deliveries[0].1.args.len(), 3);
    }

    #[tokio::test]
    async fn chord_abandoned_when_a_member_failed() {
        let backend: Arc<dyn Backend> = backend();
        let submitter = submitter();
        let chord = Signature::new("chord", "collect", vec![]);

        let mut ok_member = Signature::new("m1", "member", vec![]);
        ok_member.group_uuid = Some("g2".into());
        ok_member.group_task_count = Some(2);
        ok_member.chord_callback = Some(Box::new(chord.clone()));

        let mut failing_member = Signature::new("m2", "member", vec![]);
        failing_member.group_uuid = Some("g2".into());
        failing_member.group_task_count = Some(2);
        failing_member.chord_callback = Some(Box::new(chord));

        task_succeeded(&backend, &submitter, &mut ok_member, vec![])
            .await
            .unwrap();
        task_failed(&backend, &submitter, &mut failing_member, "nope")
            .await
            .unwrap();

        let delivered = submitter.read_new(10, None).await.unwrap();
        assert!(delivered.iter().all(|(_, sig)| sig.uuid != "chord"));
    }
}
