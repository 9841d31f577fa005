pub mod task;
pub mod retry;
pub mod cycle_check;
pub mod executor;
pub mod context;
pub mod reporter;
pub mod config;
pub mod logging;
pub mod pipeline;

pub use task::{task_fn, Task, TaskFn, TaskState};
pub use retry::{RetryPolicy, RetryExecutor};
pub use executor::{Flow, RunOptions, RunSummary};
pub use cycle_check::find_cycle;
pub use context::{CancelReason, RunContext};
pub use reporter::{RecordingReporter, RunEvent, RunReporter, TracingReporter};
pub use config::FlowConfig;
pub use pipeline::{
    Pipeline, PipelineDescriptor, PipelineRegistry, PipelineRequest, PipelineResult,
};

use std::sync::Arc;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Underlying cause of a task failure. Shared so the error recorded on a
/// task and the one returned from the run point at the same value.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Converts anything boxable as an error (`anyhow::Error`, `&str`, ...) into
/// a [`SharedError`].
pub fn shared_error(err: impl Into<BoxError>) -> SharedError {
    Arc::from(err.into())
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("flow {flow}: task {task} is already registered")]
    DuplicateTask { flow: String, task: String },
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("flow {flow}: circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { flow: String, cycle: Vec<String> },
    #[error("task {task} failed after {attempts} attempts: {source}")]
    TaskFailed {
        task: String,
        attempts: u32,
        #[source]
        source: SharedError,
    },
    #[error("task {task} cancelled: {reason}")]
    TaskCancelled { task: String, reason: CancelReason },
    #[error("flow {flow} cancelled: {reason}")]
    Cancelled { flow: String, reason: CancelReason },
    #[error("flow {flow}: deadlock detected, pending tasks: {}", .pending.join(", "))]
    Deadlock { flow: String, pending: Vec<String> },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("pipeline {pipeline}: {message}")]
    Pipeline { pipeline: String, message: String },
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),
    #[error("Pipeline already registered: {0}")]
    DuplicatePipeline(String),
}

impl FlowError {
    /// True for errors caused by the run context being cancelled or timing
    /// out, as opposed to a task's own logic failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            FlowError::TaskCancelled { .. } | FlowError::Cancelled { .. }
        )
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, FlowError::Deadlock { .. })
    }

    /// The cancellation reason, if this is a cancellation error.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            FlowError::TaskCancelled { reason, .. } | FlowError::Cancelled { reason, .. } => {
                Some(*reason)
            }
            _ => None,
        }
    }

    /// A copy of a task-level error (`TaskFailed` or `TaskCancelled`)
    /// sharing the same cause. Other variants are never recorded on a task.
    pub fn task_error_copy(&self) -> Option<FlowError> {
        match self {
            FlowError::TaskFailed {
                task,
                attempts,
                source,
            } => Some(FlowError::TaskFailed {
                task: task.clone(),
                attempts: *attempts,
                source: Arc::clone(source),
            }),
            FlowError::TaskCancelled { task, reason } => Some(FlowError::TaskCancelled {
                task: task.clone(),
                reason: *reason,
            }),
            _ => None,
        }
    }

    /// Name of the task this error is attributed to, if any.
    pub fn task_name(&self) -> Option<&str> {
        match self {
            FlowError::DuplicateTask { task, .. }
            | FlowError::UnknownDependency { task, .. }
            | FlowError::TaskFailed { task, .. }
            | FlowError::TaskCancelled { task, .. } => Some(task),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
