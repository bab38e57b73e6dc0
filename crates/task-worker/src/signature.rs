//! The task signature data model.
//!
//! A `Signature` is the unit of work passed between producers, the broker,
//! and the worker. It survives retries (the `uuid` never changes) and
//! carries everything needed to invoke a registered task, transition its
//! state in the backend, and fan out to downstream callbacks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A weakly typed argument tag, used by the task runtime to coerce `value`
/// into a native Rust type before binding it to a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    I64,
    F64,
    Bool,
    String,
    Json,
}

/// A single `{type, value}` argument or result slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    pub value: Value,
}

impl Arg {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            arg_type: ArgType::String,
            value: Value::String(value.into()),
        }
    }

    pub fn i64(value: i64) -> Self {
        Self {
            arg_type: ArgType::I64,
            value: Value::from(value),
        }
    }

    pub fn f64(value: f64) -> Self {
        Self {
            arg_type: ArgType::F64,
            value: Value::from(value),
        }
    }

    pub fn bool(value: bool) -> Self {
        Self {
            arg_type: ArgType::Bool,
            value: Value::from(value),
        }
    }
}

/// A value produced by a successful invocation. Structurally identical to
/// `Arg` (it is reflected straight back into the args of whatever consumes
/// it), but kept as a distinct type so the pipeline's intent is unambiguous
/// at call sites.
pub type TaskResult = Arg;

/// The terminal or intermediate state of a task, as tracked by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Received,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// The task descriptor dispatched by producers and consumed by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub uuid: String,
    pub name: String,
    pub args: Vec<Arg>,

    /// Absolute dispatch time; `None` means "now".
    pub eta: Option<DateTime<Utc>>,
    /// Remaining retries.
    pub retry_count: u32,
    /// Seconds used for the most recent backoff; advances via Fibonacci on
    /// each implicit retry.
    pub retry_timeout: u64,
    /// The backoff second-to-last used, kept alongside `retry_timeout` so
    /// the two-term Fibonacci recurrence can advance without needing a
    /// separately stored retry counter.
    #[serde(default)]
    pub retry_timeout_prev: u64,

    pub on_success: Vec<Signature>,
    pub on_error: Vec<Signature>,
    pub chord_callback: Option<Box<Signature>>,

    pub group_uuid: Option<String>,
    pub group_task_count: Option<usize>,

    /// If true, this signature's args are never extended with upstream
    /// results (success chain, error chain, or chord callback).
    pub immutable: bool,

    /// Opaque trace-context propagation headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Signature {
    /// Construct a bare signature for the named task with the given args.
    /// All scheduling/composition fields take their zero value.
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            args,
            eta: None,
            retry_count: 0,
            retry_timeout: 0,
            retry_timeout_prev: 0,
            on_success: Vec::new(),
            on_error: Vec::new(),
            chord_callback: None,
            group_uuid: None,
            group_task_count: None,
            immutable: false,
            headers: HashMap::new(),
        }
    }

    /// Append results to `args`. Gating on `immutable` is the caller's
    /// responsibility: it is the *source* signature's `immutable` flag
    /// that decides whether its results propagate into a child's args,
    /// not the child's own flag.
    pub fn extend_args_with_results(&mut self, results: &[TaskResult]) {
        self.args.extend(results.iter().cloned());
    }

    /// Prepend the error message as argument 0 for on-error fan-out.
    pub fn prepend_error_arg(&mut self, message: &str) {
        self.args.insert(0, Arg::string(message));
    }
}
