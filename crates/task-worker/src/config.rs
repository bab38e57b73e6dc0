//! Worker configuration: the tunables a `Worker` needs to consume a queue
//! and supervise its own concurrency and shutdown behavior.

use uuid::Uuid;

/// Tunables consumed by the worker core. Never parses a CLI itself, since
/// that is the embedding application's job.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Rendered into the startup banner; never parsed or connected to by
    /// this crate.
    pub broker_url: String,
    pub backend_url: String,

    /// The queue/stream the broker consumes from.
    pub queue_name: String,

    /// Identifies this worker instance to the broker (consumer tag /
    /// consumer group member id).
    pub consumer_tag: String,

    /// Number of task pipelines allowed in flight at once.
    pub concurrency: usize,

    /// Disables the SIGINT/SIGTERM handler, set by embedding
    /// applications that manage their own process lifecycle.
    pub no_unix_signals: bool,

    /// How long a single `read_new` poll blocks before returning empty,
    /// letting the consumer loop re-check for shutdown.
    pub poll_timeout_ms: u64,

    /// Messages requested per poll.
    pub batch_size: usize,
}

impl WorkerConfig {
    pub fn new(broker_url: impl Into<String>, backend_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            backend_url: backend_url.into(),
            queue_name: "celery".to_string(),
            consumer_tag: format!("worker-{}", Uuid::new_v4()),
            concurrency: 1,
            no_unix_signals: false,
            poll_timeout_ms: 1000,
            batch_size: 10,
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_no_unix_signals(mut self, disable: bool) -> Self {
        self.no_unix_signals = disable;
        self
    }

    pub fn with_poll_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("memory://", "memory://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue_name, "celery");
        assert_eq!(config.concurrency, 1);
        assert!(!config.no_unix_signals);
        assert!(config.consumer_tag.starts_with("worker-"));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = WorkerConfig::new("redis://localhost", "redis://localhost")
            .with_queue_name("orders")
            .with_consumer_tag("worker-1")
            .with_concurrency(8)
            .with_no_unix_signals(true)
            .with_batch_size(50);

        assert_eq!(config.queue_name, "orders");
        assert_eq!(config.consumer_tag, "worker-1");
        assert_eq!(config.concurrency, 8);
        assert!(config.no_unix_signals);
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn concurrency_cannot_be_zero() {
        let config = WorkerConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }
}
