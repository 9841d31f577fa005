//! Run lifecycle events.
//!
//! The executor never formats log lines itself; it hands every lifecycle
//! transition to a [`RunReporter`]. [`TracingReporter`] turns them into
//! structured `tracing` events keyed by `pipeline` and `step`, and
//! [`RecordingReporter`] keeps them in memory.

use std::fmt::Display;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::FlowError;

/// Receiver of run lifecycle events.
///
/// Per task the executor emits `task_started`, then zero or more
/// `task_retrying`, then exactly one of `task_completed` / `task_failed`.
/// Skipped tasks only get `task_skipped`. Each run ends with exactly one of
/// `run_completed` / `run_failed`.
pub trait RunReporter: Send + Sync {
    fn run_started(&self, flow: &str, tasks: &[String]);
    fn task_started(&self, flow: &str, task: &str);
    fn task_retrying(
        &self,
        flow: &str,
        task: &str,
        attempt: u32,
        max_attempts: u32,
        error: &dyn Display,
    );
    fn task_completed(&self, flow: &str, task: &str, elapsed: Duration);
    fn task_failed(&self, flow: &str, task: &str, elapsed: Duration, error: &dyn Display);
    fn task_skipped(&self, flow: &str, task: &str);
    fn run_completed(&self, flow: &str, elapsed: Duration, completed: usize);
    fn run_failed(&self, flow: &str, elapsed: Duration, completed: usize, error: &FlowError);
}

/// Default reporter: one `tracing` event per lifecycle transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl RunReporter for TracingReporter {
    fn run_started(&self, flow: &str, tasks: &[String]) {
        info!(
            pipeline = flow,
            task_count = tasks.len(),
            tasks = ?tasks,
            "pipeline started"
        );
    }

    fn task_started(&self, flow: &str, task: &str) {
        info!(pipeline = flow, step = task, "step started");
    }

    fn task_retrying(
        &self,
        flow: &str,
        task: &str,
        attempt: u32,
        max_attempts: u32,
        error: &dyn Display,
    ) {
        warn!(
            pipeline = flow,
            step = task,
            attempt,
            max_attempts,
            error = %error,
            "step attempt failed, retrying"
        );
    }

    fn task_completed(&self, flow: &str, task: &str, elapsed: Duration) {
        info!(
            pipeline = flow,
            step = task,
            duration_ms = elapsed.as_millis() as u64,
            "step completed"
        );
    }

    fn task_failed(&self, flow: &str, task: &str, elapsed: Duration, error: &dyn Display) {
        error!(
            pipeline = flow,
            step = task,
            duration_ms = elapsed.as_millis() as u64,
            error = %error,
            "step failed"
        );
    }

    fn task_skipped(&self, flow: &str, task: &str) {
        info!(pipeline = flow, step = task, "step skipped");
    }

    fn run_completed(&self, flow: &str, elapsed: Duration, completed: usize) {
        info!(
            pipeline = flow,
            duration_ms = elapsed.as_millis() as u64,
            tasks_completed = completed,
            "pipeline completed"
        );
    }

    fn run_failed(&self, flow: &str, elapsed: Duration, completed: usize, error: &FlowError) {
        error!(
            pipeline = flow,
            duration_ms = elapsed.as_millis() as u64,
            tasks_completed = completed,
            error = %error,
            "pipeline failed"
        );
    }
}

/// An owned copy of one reporter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        flow: String,
        tasks: Vec<String>,
    },
    TaskStarted {
        flow: String,
        task: String,
    },
    TaskRetrying {
        flow: String,
        task: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    TaskCompleted {
        flow: String,
        task: String,
        duration_ms: u64,
    },
    TaskFailed {
        flow: String,
        task: String,
        duration_ms: u64,
        error: String,
    },
    TaskSkipped {
        flow: String,
        task: String,
    },
    RunCompleted {
        flow: String,
        duration_ms: u64,
        completed: usize,
    },
    RunFailed {
        flow: String,
        duration_ms: u64,
        completed: usize,
        error: String,
    },
}

impl RunEvent {
    pub fn task(&self) -> Option<&str> {
        match self {
            RunEvent::TaskStarted { task, .. }
            | RunEvent::TaskRetrying { task, .. }
            | RunEvent::TaskCompleted { task, .. }
            | RunEvent::TaskFailed { task, .. }
            | RunEvent::TaskSkipped { task, .. } => Some(task),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. })
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events concerning a single task, in order.
    pub fn events_for(&self, task: &str) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task() == Some(task))
            .collect()
    }

    pub fn retry_count(&self, task: &str) -> usize {
        self.events_for(task)
            .iter()
            .filter(|e| matches!(e, RunEvent::TaskRetrying { .. }))
            .count()
    }

    fn push(&self, event: RunEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl RunReporter for RecordingReporter {
    fn run_started(&self, flow: &str, tasks: &[String]) {
        self.push(RunEvent::RunStarted {
            flow: flow.to_string(),
            tasks: tasks.to_vec(),
        });
    }

    fn task_started(&self, flow: &str, task: &str) {
        self.push(RunEvent::TaskStarted {
            flow: flow.to_string(),
            task: task.to_string(),
        });
    }

    fn task_retrying(
        &self,
        flow: &str,
        task: &str,
        attempt: u32,
        max_attempts: u32,
        error: &dyn Display,
    ) {
        self.push(RunEvent::TaskRetrying {
            flow: flow.to_string(),
            task: task.to_string(),
            attempt,
            max_attempts,
            error: error.to_string(),
        });
    }

    fn task_completed(&self, flow: &str, task: &str, elapsed: Duration) {
        self.push(RunEvent::TaskCompleted {
            flow: flow.to_string(),
            task: task.to_string(),
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    fn task_failed(&self, flow: &str, task: &str, elapsed: Duration, error: &dyn Display) {
        self.push(RunEvent::TaskFailed {
            flow: flow.to_string(),
            task: task.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            error: error.to_string(),
        });
    }

    fn task_skipped(&self, flow: &str, task: &str) {
        self.push(RunEvent::TaskSkipped {
            flow: flow.to_string(),
            task: task.to_string(),
        });
    }

    fn run_completed(&self, flow: &str, elapsed: Duration, completed: usize) {
        self.push(RunEvent::RunCompleted {
            flow: flow.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            completed,
        });
    }

    fn run_failed(&self, flow: &str, elapsed: Duration, completed: usize, error: &FlowError) {
        self.push(RunEvent::RunFailed {
            flow: flow.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            completed,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reporter_keeps_order() {
        let reporter = RecordingReporter::new();
        reporter.run_started("f", &["a".to_string()]);
        reporter.task_started("f", "a");
        reporter.task_retrying("f", "a", 1, 3, &"boom");
        reporter.task_completed("f", "a", Duration::from_millis(12));
        reporter.run_completed("f", Duration::from_millis(20), 1);

        let events = reporter.events();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], RunEvent::RunStarted { .. }));
        assert!(events[4].is_terminal());
        assert_eq!(reporter.events_for("a").len(), 3);
        assert_eq!(reporter.retry_count("a"), 1);
        assert_eq!(
            events[3],
            RunEvent::TaskCompleted {
                flow: "f".into(),
                task: "a".into(),
                duration_ms: 12
            }
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = RunEvent::TaskSkipped {
            flow: "f".into(),
            task: "email".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_skipped");
        assert_eq!(json["task"], "email");
    }
}
