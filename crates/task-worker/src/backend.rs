//! The result backend port plus reference implementations.
//!
//! `Backend` is the durable store of task and group state. The one
//! operation that matters most for correctness is `trigger_chord`: it must
//! behave as an atomic, cluster-wide single-winner claim so that a chord
//! callback fires exactly once no matter how many workers race on the
//! group's completion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::WorkerError;
use crate::signature::{Signature, TaskResult, TaskState};

#[async_trait]
pub trait Backend: Send + Sync {
    async fn set_state_received(&self, sig: &Signature) -> Result<(), WorkerError>;
    async fn set_state_started(&self, sig: &Signature) -> Result<(), WorkerError>;
    async fn set_state_retry(&self, sig: &Signature) -> Result<(), WorkerError>;
    async fn set_state_success(
        &self,
        sig: &Signature,
        results: &[TaskResult],
    ) -> Result<(), WorkerError>;
    async fn set_state_failure(&self, sig: &Signature, message: &str) -> Result<(), WorkerError>;

    /// True iff every one of `expected_count` members of `group_uuid` has
    /// reached a terminal state.
    async fn group_completed(
        &self,
        group_uuid: &str,
        expected_count: usize,
    ) -> Result<bool, WorkerError>;

    /// Atomic single-winner claim on the group's chord callback. Returns
    /// `true` for exactly one caller per `group_uuid`, cluster-wide.
    async fn trigger_chord(&self, group_uuid: &str) -> Result<bool, WorkerError>;

    /// The recorded `(Signature, TaskState, results)` for every member of
    /// the group, in the order the backend chooses to return them (this
    /// order is what the chord callback's argument assembly iterates).
    async fn group_task_states(
        &self,
        group_uuid: &str,
        expected_count: usize,
    ) -> Result<Vec<(Signature, TaskState, Vec<TaskResult>)>, WorkerError>;

    /// Best-effort cleanup of group bookkeeping. A no-op is always safe.
    async fn purge_group_meta(&self, group_uuid: &str) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone, Default)]
struct TaskRecord {
    state: TaskState,
    signature: Option<Signature>,
    results: Vec<TaskResult>,
    message: Option<String>,
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Pending
    }
}

#[derive(Debug, Default)]
struct GroupRecord {
    members: HashMap<String, TaskRecord>,
    chord_triggered: bool,
}

/// In-memory reference backend. Good enough for single-process tests and
/// for demonstrating the exactly-once chord contract under concurrent
/// `tokio::spawn` racers; not durable across restarts.
#[derive(Default)]
pub struct InMemoryBackend {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    groups: Mutex<HashMap<String, GroupRecord>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience accessor for callers (tests, admin tooling) that just
    /// want a single task's current state without going through the
    /// group-oriented trait methods.
    pub async fn task_state(&self, uuid: &str) -> Option<TaskState> {
        self.tasks.lock().await.get(uuid).map(|record| record.state)
    }

    async fn set_state(&self, sig: &Signature, state: TaskState) {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.entry(sig.uuid.clone()).or_default();
        record.state = state;
        record.signature = Some(sig.clone());

        if let Some(group_uuid) = &sig.group_uuid {
            let mut groups = self.groups.lock().await;
            let group = groups.entry(group_uuid.clone()).or_default();
            let member = group.members.entry(sig.uuid.clone()).or_default();
            member.state = state;
            member.signature = Some(sig.clone());
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn set_state_received(&self, sig: &Signature) -> Result<(), WorkerError> {
        self.set_state(sig, TaskState::Received).await;
        Ok(())
    }

    async fn set_state_started(&self, sig: &Signature) -> Result<(), WorkerError> {
        self.set_state(sig, TaskState::Started).await;
        Ok(())
    }

    async fn set_state_retry(&self, sig: &Signature) -> Result<(), WorkerError> {
        self.set_state(sig, TaskState::Retry).await;
        Ok(())
    }

    async fn set_state_success(
        &self,
        sig: &Signature,
        results: &[TaskResult],
    ) -> Result<(), WorkerError> {
        self.set_state(sig, TaskState::Success).await;
        let mut tasks = self.tasks.lock().await;
        if let Some(record) = tasks.get_mut(&sig.uuid) {
            record.results = results.to_vec();
        }
        if let Some(group_uuid) = &sig.group_uuid {
            let mut groups = self.groups.lock().await;
            if let Some(group) = groups.get_mut(group_uuid) {
                if let Some(member) = group.members.get_mut(&sig.uuid) {
                    member.results = results.to_vec();
                }
            }
        }
        Ok(())
    }

    async fn set_state_failure(&self, sig: &Signature, message: &str) -> Result<(), WorkerError> {
        self.set_state(sig, TaskState::Failure).await;
        let mut tasks = self.tasks.lock().await;
        if let Some(record) = tasks.get_mut(&sig.uuid) {
            record.message = Some(message.to_string());
        }
        Ok(())
    }

    async fn group_completed(
        &self,
        group_uuid: &str,
        expected_count: usize,
    ) -> Result<bool, WorkerError> {
        let groups = self.groups.lock().await;
        let Some(group) = groups.get(group_uuid) else {
            return Ok(false);
        };
        if group.members.len() < expected_count {
            return Ok(false);
        }
        Ok(group
            .members
            .values()
            .all(|member| member.state.is_terminal()))
    }

    async fn trigger_chord(&self, group_uuid: &str) -> Result<bool, WorkerError> {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(group_uuid.to_string()).or_default();
        if group.chord_triggered {
            return Ok(false);
        }
        group.chord_triggered = true;
        Ok(true)
    }

    async fn group_task_states(
        &self,
        group_uuid: &str,
        _expected_count: usize,
    ) -> Result<Vec<(Signature, TaskState, Vec<TaskResult>)>, WorkerError> {
        let groups = self.groups.lock().await;
        let Some(group) = groups.get(group_uuid) else {
            return Ok(Vec::new());
        };
        Ok(group
            .members
            .values()
            .filter_map(|m| {
                m.signature
                    .clone()
                    .map(|s| (s, m.state, m.results.clone()))
            })
            .collect())
    }

    async fn purge_group_meta(&self, group_uuid: &str) -> Result<(), WorkerError> {
        let mut groups = self.groups.lock().await;
        groups.remove(group_uuid);
        Ok(())
    }
}

/// Convenience alias for sharing a backend across the worker and the
/// callback orchestrator.
pub type SharedBackend = Arc<dyn Backend>;

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    //! Redis-backed `Backend`. Group membership is kept in a Redis hash
    //! (`{prefix}:group:{group_uuid}`); the chord claim uses `SETNX` on
    //! `{prefix}:chord:{group_uuid}`, Redis's native atomic single-winner
    //! primitive.

    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    pub struct RedisBackend {
        redis: Arc<Mutex<ConnectionManager>>,
        key_prefix: String,
    }

    impl RedisBackend {
        pub fn new(redis: ConnectionManager, key_prefix: impl Into<String>) -> Self {
            Self {
                redis: Arc::new(Mutex::new(redis)),
                key_prefix: key_prefix.into(),
            }
        }

        fn task_key(&self, uuid: &str) -> String {
            format!("{}:task:{}", self.key_prefix, uuid)
        }

        fn group_key(&self, group_uuid: &str) -> String {
            format!("{}:group:{}", self.key_prefix, group_uuid)
        }

        fn chord_key(&self, group_uuid: &str) -> String {
            format!("{}:chord:{}", self.key_prefix, group_uuid)
        }

        async fn write_state(
            &self,
            sig: &Signature,
            state: TaskState,
            results: &[TaskResult],
            message: Option<&str>,
        ) -> Result<(), WorkerError> {
            let mut conn = self.redis.lock().await;
            let payload = serde_json::to_string(&(
                state,
                sig.clone(),
                results.to_vec(),
                message.map(str::to_string),
            ))?;
            conn.set::<_, _, ()>(self.task_key(&sig.uuid), &payload)
                .await
                .map_err(|e| WorkerError::backend(&sig.uuid, e))?;

            if let Some(group_uuid) = &sig.group_uuid {
                conn.hset::<_, _, _, ()>(self.group_key(group_uuid), &sig.uuid, &payload)
                    .await
                    .map_err(|e| WorkerError::backend(&sig.uuid, e))?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for RedisBackend {
        async fn set_state_received(&self, sig: &Signature) -> Result<(), WorkerError> {
            self.write_state(sig, TaskState::Received, &[], None).await
        }

        async fn set_state_started(&self, sig: &Signature) -> Result<(), WorkerError> {
            self.write_state(sig, TaskState::Started, &[], None).await
        }

        async fn set_state_retry(&self, sig: &Signature) -> Result<(), WorkerError> {
            self.write_state(sig, TaskState::Retry, &[], None).await
        }

        async fn set_state_success(
            &self,
            sig: &Signature,
            results: &[TaskResult],
        ) -> Result<(), WorkerError> {
            self.write_state(sig, TaskState::Success, results, None).await
        }

        async fn set_state_failure(&self, sig: &Signature, message: &str) -> Result<(), WorkerError> {
            self.write_state(sig, TaskState::Failure, &[], Some(message)).await
        }

        async fn group_completed(
            &self,
            group_uuid: &str,
            expected_count: usize,
        ) -> Result<bool, WorkerError> {
            let states = self.group_task_states(group_uuid, expected_count).await?;
            if states.len() < expected_count {
                return Ok(false);
            }
            Ok(states.iter().all(|(_, state, _)| state.is_terminal()))
        }

        async fn trigger_chord(&self, group_uuid: &str) -> Result<bool, WorkerError> {
            let mut conn = self.redis.lock().await;
            let won: bool = redis::cmd("SETNX")
                .arg(self.chord_key(group_uuid))
                .arg("1")
                .query_async(&mut *conn)
                .await
                .map_err(|e| WorkerError::backend(group_uuid, e))?;
            Ok(won)
        }

        async fn group_task_states(
            &self,
            group_uuid: &str,
            _expected_count: usize,
        ) -> Result<Vec<(Signature, TaskState, Vec<TaskResult>)>, WorkerError> {
            let mut conn = self.redis.lock().await;
            let entries: HashMap<String, String> = conn
                .hgetall(self.group_key(group_uuid))
                .await
                .map_err(|e| WorkerError::backend(group_uuid, e))?;

            let mut out = Vec::with_capacity(entries.len());
            for payload in entries.into_values() {
                let (state, sig, results, _message): (
                    TaskState,
                    Signature,
                    Vec<TaskResult>,
                    Option<String>,
                ) = serde_json::from_str(&payload)?;
                out.push((sig, state, results));
            }
            Ok(out)
        }

        async fn purge_group_meta(&self, group_uuid: &str) -> Result<(), WorkerError> {
            let mut conn = self.redis.lock().await;
            conn.del::<_, ()>(self.group_key(group_uuid))
                .await
                .map_err(|e| WorkerError::backend(group_uuid, e))?;
            conn.del::<_, ()>(self.chord_key(group_uuid))
                .await
                .map_err(|e| WorkerError::backend(group_uuid, e))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Arg;

    fn group_member(group: &str, n: usize) -> Signature {
        let mut sig = Signature::new(format!("u{n}"), "member", vec![Arg::i64(n as i64)]);
        sig.group_uuid = Some(group.to_string());
        sig.group_task_count = Some(3);
        sig
    }

    #[tokio::test]
    async fn group_completed_false_until_all_terminal() {
        let backend = InMemoryBackend::new();
        let a = group_member("g1", 1);
        let b = group_member("g1", 2);
        let c = group_member("g1", 3);

        backend.set_state_success(&a, &[]).await.unwrap();
        backend.set_state_success(&b, &[]).await.unwrap();
        assert!(!backend.group_completed("g1", 3).await.unwrap());

        backend.set_state_success(&c, &[]).await.unwrap();
        assert!(backend.group_completed("g1", 3).await.unwrap());
    }

    #[tokio::test]
    async fn trigger_chord_is_single_winner() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                backend.trigger_chord("g1").await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn group_task_states_reflects_success_results() {
        let backend = InMemoryBackend::new();
        let mut a = group_member("g2", 1);
        a.args = vec![];
        backend
            .set_state_success(&a, &[Arg::i64(42)])
            .await
            .unwrap();

        let states = backend.group_task_states("g2", 1).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].1, TaskState::Success);
        assert_eq!(states[0].2, vec![Arg::i64(42)]);
    }
}
