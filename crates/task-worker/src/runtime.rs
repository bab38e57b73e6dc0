//! The task runtime port: a named-function registry that binds `Arg`s to a
//! registered handler and invokes it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::signature::{Arg, TaskResult};

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerOutcome> + Send>>;

/// What a task handler returns. `Ok` carries zero or more results.
/// `Err(WorkerError::RetryRequested(_))` is the explicit-retry sentinel;
/// any other `Err` is classified by the pipeline into an implicit retry or
/// a terminal failure depending on `retry_count`.
pub type HandlerOutcome = Result<Vec<TaskResult>, WorkerError>;

/// A registered task handler: takes the bound arguments, returns a future.
pub trait TaskHandler: Send + Sync {
    fn call(&self, args: Vec<Arg>) -> HandlerFuture;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(Vec<Arg>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn call(&self, args: Vec<Arg>) -> HandlerFuture {
        Box::pin(self(args))
    }
}

/// The task runtime port: build an invocable task from a registered
/// function and args, invoke it, and report whether the name is known at
/// all.
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    fn is_registered(&self, name: &str) -> bool;

    /// Validate the argument list against the registered handler's
    /// expected arity before the pipeline transitions to `Started`. A
    /// binding failure is permanent.
    fn bind(&self, name: &str, args: &[Arg]) -> Result<(), WorkerError>;

    async fn invoke(&self, name: &str, args: Vec<Arg>) -> HandlerOutcome;
}

/// A simple in-process registry. Handlers are registered once at startup
/// and are immutable thereafter.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

#[derive(Clone)]
struct RegisteredHandler {
    handler: Arc<dyn TaskHandler>,
    arity: Option<usize>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. `arity`, if given, is checked
    /// against the number of args on every invocation; `None` means "any
    /// number of args is acceptable" (the handler does its own validation).
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, arity: Option<usize>, handler: F)
    where
        F: Fn(Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.handlers.insert(
            name.into(),
            RegisteredHandler {
                handler: Arc::new(handler),
                arity,
            },
        );
    }
}

#[async_trait]
impl TaskRuntime for TaskRegistry {
    fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    fn bind(&self, name: &str, args: &[Arg]) -> Result<(), WorkerError> {
        let Some(registered) = self.handlers.get(name) else {
            return Err(WorkerError::task_binding(name, "task not registered"));
        };
        if let Some(expected) = registered.arity {
            if args.len() != expected {
                return Err(WorkerError::task_binding(
                    name,
                    format!("expected {expected} args, got {}", args.len()),
                ));
            }
        }
        Ok(())
    }

    async fn invoke(&self, name: &str, args: Vec<Arg>) -> HandlerOutcome {
        let Some(registered) = self.handlers.get(name) else {
            return Err(WorkerError::task_binding(name, "task not registered"));
        };
        registered.handler.call(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn add(args: Vec<Arg>) -> HandlerOutcome {
        let a = args[0].value.as_i64().unwrap();
        let b = args[1].value.as_i64().unwrap();
        Ok(vec![Arg::i64(a + b)])
    }

    #[tokio::test]
    async fn invokes_registered_handler() {
        let mut registry = TaskRegistry::new();
        registry.register("add", Some(2), add);

        assert!(registry.is_registered("add"));
        assert!(!registry.is_registered("subtract"));

        let results = registry
            .invoke("add", vec![Arg::i64(2), Arg::i64(3)])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value, Value::from(5));
    }

    #[test]
    fn bind_rejects_wrong_arity() {
        let mut registry = TaskRegistry::new();
        registry.register("add", Some(2), add);

        assert!(registry.bind("add", &[Arg::i64(1)]).is_err());
        assert!(registry.bind("add", &[Arg::i64(1), Arg::i64(2)]).is_ok());
    }

    #[test]
    fn bind_unknown_task_is_an_error() {
        let registry = TaskRegistry::new();
        assert!(registry.bind("ghost", &[]).is_err());
    }
}
