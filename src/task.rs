use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::{FlowError, RetryPolicy};

/// A task's work: a zero-argument fallible operation that may be called once
/// per attempt.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Boxes any async closure into a [`TaskFn`].
pub fn task_fn<F, Fut>(work: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(work()))
}

/// Lifecycle of a task within one run. Transitions only move forward:
/// `Pending -> Running -> Done | Failed`, or `Pending -> Done` for a skipped
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    fn can_become(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Done)
                | (TaskState::Running, TaskState::Done)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct Task {
    name: String,
    work: TaskFn,
    dependencies: Vec<String>,
    retry_policy: Option<RetryPolicy>,
    state: TaskState,
    error: Option<FlowError>,
    attempts: u32,
    skipped: bool,
}

impl Task {
    pub(crate) fn new(
        name: String,
        work: TaskFn,
        dependencies: Vec<String>,
        retry_policy: Option<RetryPolicy>,
    ) -> Self {
        let mut deps: Vec<String> = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        Self {
            name,
            work,
            dependencies: deps,
            retry_policy,
            state: TaskState::Pending,
            error: None,
            attempts: 0,
            skipped: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared dependency names, duplicates removed, declaration order kept.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Per-task override of the flow's retry policy.
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry_policy
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The recorded failure, present only in state `Failed`.
    pub fn error(&self) -> Option<&FlowError> {
        self.error.as_ref()
    }

    /// Attempts made by the last execution; zero if the task never ran.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn was_skipped(&self) -> bool {
        self.skipped
    }

    pub(crate) fn work(&self) -> TaskFn {
        Arc::clone(&self.work)
    }

    pub(crate) fn mark_running(&mut self) {
        self.transition(TaskState::Running);
    }

    pub(crate) fn mark_done(&mut self, attempts: u32) {
        self.attempts = attempts;
        self.transition(TaskState::Done);
    }

    pub(crate) fn mark_skipped(&mut self) {
        self.skipped = true;
        self.transition(TaskState::Done);
    }

    pub(crate) fn mark_failed(&mut self, error: FlowError, attempts: u32) {
        self.attempts = attempts;
        self.error = Some(error);
        self.transition(TaskState::Failed);
    }


    fn transition(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_become(next),
            "task {}: illegal transition {} -> {}",
            self.name,
            self.state,
            next
        );
        if self.state.can_become(next) {
            self.state = next;
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("retry_policy", &self.retry_policy)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("skipped", &self.skipped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TaskFn {
        task_fn(|| async { Ok(()) })
    }

    #[test]
    fn dependencies_are_deduplicated_in_order() {
        let task = Task::new(
            "t".into(),
            noop(),
            vec!["b".into(), "a".into(), "b".into()],
            None,
        );
        assert_eq!(task.dependencies(), ["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn forward_transitions() {
        let mut task = Task::new("t".into(), noop(), vec![], None);
        assert_eq!(task.state(), TaskState::Pending);
        task.mark_running();
        assert_eq!(task.state(), TaskState::Running);
        task.mark_done(2);
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(task.attempts(), 2);
        assert!(!task.was_skipped());
    }

    #[test]
    fn skipping_goes_straight_to_done() {
        let mut task = Task::new("t".into(), noop(), vec![], None);
        task.mark_skipped();
        assert_eq!(task.state(), TaskState::Done);
        assert!(task.was_skipped());
        assert_eq!(task.attempts(), 0);
    }

    #[test]
    fn failure_records_error() {
        let mut task = Task::new("t".into(), noop(), vec![], None);
        task.mark_running();
        task.mark_failed(
            FlowError::TaskFailed {
                task: "t".into(),
                attempts: 1,
                source: crate::shared_error("boom"),
            },
            1,
        );
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(
            task.error().map(ToString::to_string).as_deref(),
            Some("task t failed after 1 attempts: boom")
        );
    }

    #[tokio::test]
    async fn task_fn_can_be_called_repeatedly() {
        let work = task_fn(|| async { Ok(()) });
        assert!(work().await.is_ok());
        assert!(work().await.is_ok());
    }
}
