//! Error types for the task worker.
//!
//! This module provides `WorkerError`, classifying failures the way the
//! pipeline needs to react to them: a transient broker error restarts the
//! consumer loop, a backend write error is wrapped with task context and
//! returned, a task-binding error is a permanent failure, and a
//! task-invocation error is further classified by the pipeline into an
//! implicit retry, an explicit retry, or a terminal failure.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Transient broker error, surfaced to the consumer restart loop.
    #[error("broker error: {0}")]
    Broker(String),

    /// Backend write error, wrapped with task UUID context.
    #[error("backend error for task {uuid}: {source}")]
    Backend { uuid: String, source: String },

    /// The task runtime could not bind `args` to the registered function's
    /// parameters. Always a permanent failure; never retried.
    #[error("failed to bind arguments for task {uuid}: {details}")]
    TaskBinding { uuid: String, details: String },

    /// Raw error returned by user task code.
    #[error("task invocation failed: {0}")]
    TaskInvocation(String),

    /// User task code explicitly requested a retry after a specific delay.
    #[error("task requested retry in {0:?}")]
    RetryRequested(std::time::Duration),

    /// A callback (chain child or chord) could not be submitted.
    #[error("failed to submit callback: {0}")]
    CallbackSubmission(String),

    /// Argument/result (de)serialization.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn backend(uuid: impl Into<String>, source: impl ToString) -> Self {
        Self::Backend {
            uuid: uuid.into(),
            source: source.to_string(),
        }
    }

    pub fn task_binding(uuid: impl Into<String>, details: impl Into<String>) -> Self {
        Self::TaskBinding {
            uuid: uuid.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_carries_uuid() {
        let err = WorkerError::backend("u1", "connection reset");
        assert!(err.to_string().contains("u1"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn task_binding_carries_details() {
        let err = WorkerError::task_binding("u1", "missing arg 0");
        assert!(err.to_string().contains("u1"));
        assert!(err.to_string().contains("missing arg 0"));
    }
}
