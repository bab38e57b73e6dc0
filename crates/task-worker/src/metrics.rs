//! Metrics for task worker observability.
//!
//! Uses the `metrics` facade exclusively: this crate records measurements
//! but never installs an exporter. Whatever renders Prometheus/statsd/etc.
//! output is the embedding application's concern, not this library's.
//!
//! ## Available Metrics
//!
//! - `task_worker_tasks_processed_total` - Counter of tasks processed, by name and status
//! - `task_worker_task_duration_seconds` - Histogram of invocation duration, by name
//! - `task_worker_retries_total` - Counter of retry attempts (implicit + explicit), by name
//! - `task_worker_chords_triggered_total` - Counter, incremented only by the winning worker
//! - `task_worker_in_flight_tasks` - Gauge of currently executing `process` invocations

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub mod names {
    pub const TASKS_PROCESSED: &str = "task_worker_tasks_processed_total";
    pub const TASK_DURATION: &str = "task_worker_task_duration_seconds";
    pub const RETRIES: &str = "task_worker_retries_total";
    pub const CHORDS_TRIGGERED: &str = "task_worker_chords_triggered_total";
    pub const IN_FLIGHT_TASKS: &str = "task_worker_in_flight_tasks";
}

/// Task processing status for metrics labeling.
#[derive(Debug, Clone, Copy)]
pub enum TaskStatus {
    Success,
    Failure,
    Retry,
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Retry => "retry",
            Self::Unknown => "unknown",
        }
    }
}

/// Record a task as processed with the given outcome.
pub fn record_task_processed(name: &str, status: TaskStatus) {
    counter!(
        names::TASKS_PROCESSED,
        "name" => name.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

/// Record task invocation duration.
pub fn record_task_duration(name: &str, duration: Duration) {
    histogram!(
        names::TASK_DURATION,
        "name" => name.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry attempt (implicit or explicit).
pub fn record_retry(name: &str) {
    counter!(
        names::RETRIES,
        "name" => name.to_string()
    )
    .increment(1);
}

/// Record a chord trigger win. Must be called only by the worker that won
/// the atomic claim, never by a loser.
pub fn record_chord_triggered(group: &str) {
    counter!(
        names::CHORDS_TRIGGERED,
        "group" => group.to_string()
    )
    .increment(1);
}

/// Update the in-flight task gauge.
pub fn set_in_flight_tasks(count: f64) {
    gauge!(names::IN_FLIGHT_TASKS).set(count);
}

/// Times a task invocation and records its duration on drop unless
/// explicitly stopped.
pub struct MetricsTimer {
    name: String,
    start: std::time::Instant,
}

impl MetricsTimer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: std::time::Instant::now(),
        }
    }

    pub fn stop(self) {
        let duration = self.start.elapsed();
        record_task_duration(&self.name, duration);
        std::mem::forget(self);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        record_task_duration(&self.name, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_as_str() {
        assert_eq!(TaskStatus::Success.as_str(), "success");
        assert_eq!(TaskStatus::Failure.as_str(), "failure");
        assert_eq!(TaskStatus::Retry.as_str(), "retry");
        assert_eq!(TaskStatus::Unknown.as_str(), "unknown");
    }

    #[test]
    fn metrics_timer_tracks_elapsed() {
        let timer = MetricsTimer::new("add");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed().as_millis() >= 10);
    }
}
