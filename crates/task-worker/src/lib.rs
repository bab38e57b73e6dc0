//! task-worker - a broker-backed distributed task worker.
//!
//! Producers enqueue task [`signature::Signature`]s onto a [`broker::Broker`];
//! this crate dequeues them, executes the registered handler, reports state
//! transitions to a [`backend::Backend`], and orchestrates downstream
//! callbacks: on-success chains, on-error chains, and fan-in "chord"
//! barriers that fire exactly once across a cluster of workers racing on
//! the same group.
//!
//! # Architecture
//!
//! ```text
//! Broker (delivers Signatures)
//!   |
//!   v
//! Worker consumer loop --------> Pipeline::process
//!                                    |  \
//!                                    |   \-- Backend (state transitions)
//!                                    v
//!                               Callback orchestrator
//!                                    |
//!                                    v
//!                               Broker::publish (retries, chains, chords)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use task_worker::backend::InMemoryBackend;
//! use task_worker::broker::in_memory::InMemoryBroker;
//! use task_worker::config::WorkerConfig;
//! use task_worker::runtime::TaskRegistry;
//! use task_worker::signature::Arg;
//! use task_worker::worker::WorkerBuilder;
//!
//! let mut registry = TaskRegistry::new();
//! registry.register("add", Some(2), |args| async move {
//!     let a = args[0].value.as_i64().unwrap();
//!     let b = args[1].value.as_i64().unwrap();
//!     Ok(vec![Arg::i64(a + b)])
//! });
//!
//! let worker = WorkerBuilder::new(
//!     WorkerConfig::default(),
//!     Arc::new(registry),
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(InMemoryBroker::new()),
//! )
//! .build();
//! ```

pub mod backend;
pub mod broker;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod runtime;
pub mod signature;
pub mod worker;

pub use backend::{Backend, InMemoryBackend};
pub use broker::Broker;
pub use config::WorkerConfig;
pub use error::WorkerError;
pub use pipeline::Pipeline;
pub use runtime::{TaskHandler, TaskRegistry, TaskRuntime};
pub use signature::{Arg, ArgType, Signature, TaskResult, TaskState};
pub use worker::{Worker, WorkerBuilder, WorkerExit, WorkerHooks};
