use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::task::task_fn;
use crate::{
    find_cycle, FlowError, Result, RetryExecutor, RetryPolicy, RunContext, RunReporter, Task,
    TaskFn, TaskState, TracingReporter,
};

/// Extra knobs for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Tasks to mark done without executing. Their dependents still wait
    /// for them to become ready in the usual way.
    pub skip: HashSet<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(names.into_iter().map(Into::into));
        self
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub flow: String,
    /// Tasks whose work ran to success.
    pub completed: usize,
    pub skipped: Vec<String>,
    pub waves: usize,
    pub elapsed: Duration,
    /// Completion order of executed tasks.
    pub order: Vec<String>,
    pub attempts: BTreeMap<String, u32>,
}

/// A named set of tasks with dependency edges, executed in waves.
///
/// A flow is built for one run: register tasks, call [`Flow::run`] once, read
/// the outcome. Task state is kept after the run for inspection, so a second
/// run finds everything already finished.
pub struct Flow {
    name: String,
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    retry_policy: RetryPolicy,
    reporter: Arc<dyn RunReporter>,
    execution_order: Arc<Mutex<Vec<String>>>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: HashMap::new(),
            order: Vec::new(),
            retry_policy: RetryPolicy::default(),
            reporter: Arc::new(TracingReporter),
            execution_order: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Retry policy for tasks registered without their own.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn RunReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Registers a task. Dependency names are not checked against the
    /// current task set; a name that never gets registered starves the task
    /// and the run ends in a deadlock.
    pub fn add_task<F, Fut>(
        &mut self,
        name: impl Into<String>,
        work: F,
        deps: &[&str],
    ) -> Result<&mut Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(name.into(), task_fn(work), deps, None)
    }

    /// Like [`Flow::add_task`], with a retry policy for this task only.
    pub fn add_task_with_policy<F, Fut>(
        &mut self,
        name: impl Into<String>,
        policy: RetryPolicy,
        work: F,
        deps: &[&str],
    ) -> Result<&mut Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(name.into(), task_fn(work), deps, Some(policy))
    }

    /// Registers an already boxed work function.
    pub fn add_task_fn(
        &mut self,
        name: impl Into<String>,
        work: TaskFn,
        deps: &[&str],
        policy: Option<RetryPolicy>,
    ) -> Result<&mut Self> {
        self.insert(name.into(), work, deps, policy)
    }

    fn insert(
        &mut self,
        name: String,
        work: TaskFn,
        deps: &[&str],
        policy: Option<RetryPolicy>,
    ) -> Result<&mut Self> {
        if self.tasks.contains_key(&name) {
            return Err(FlowError::DuplicateTask {
                flow: self.name.clone(),
                task: name,
            });
        }

        let deps = deps.iter().map(|d| d.to_string()).collect();
        self.tasks
            .insert(name.clone(), Task::new(name.clone(), work, deps, policy));
        self.order.push(name);
        Ok(self)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.tasks.get(name).map(Task::state)
    }

    /// Task names in registration order.
    pub fn task_names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pending tasks whose dependencies are all done, sorted by name.
    /// A dependency name with no registered task is never satisfied.
    pub fn find_ready_tasks(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .tasks
            .values()
            .filter(|task| task.state() == TaskState::Pending)
            .filter(|task| {
                task.dependencies().iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.state() == TaskState::Done)
                })
            })
            .map(|task| task.name().to_string())
            .collect();
        ready.sort();
        ready
    }

    pub fn all_done(&self) -> bool {
        self.tasks.values().all(|t| t.state() == TaskState::Done)
    }

    fn pending_tasks(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.state() == TaskState::Pending)
            .map(|t| t.name().to_string())
            .collect();
        pending.sort();
        pending
    }

    /// Checks for dependency names that are not registered and for cycles.
    ///
    /// Running does not require this; a flow that fails validation ends its
    /// run with a deadlock error instead.
    pub fn validate(&self) -> Result<()> {
        for name in &self.order {
            let Some(task) = self.tasks.get(name) else {
                continue;
            };
            if let Some(dep) = task
                .dependencies()
                .iter()
                .find(|dep| !self.tasks.contains_key(*dep))
            {
                return Err(FlowError::UnknownDependency {
                    task: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        if let Some(cycle) = find_cycle(&self.tasks) {
            return Err(FlowError::CircularDependency {
                flow: self.name.clone(),
                cycle,
            });
        }

        Ok(())
    }

    /// Text rendering of the graph, one tree per root task.
    pub fn render_graph(&self) -> String {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &self.order {
            if let Some(task) = self.tasks.get(name) {
                for dep in task.dependencies() {
                    dependents.entry(dep.as_str()).or_default().push(name.as_str());
                }
            }
        }

        let mut out = String::new();
        for name in &self.order {
            let is_root = self
                .tasks
                .get(name)
                .is_some_and(|t| t.dependencies().is_empty());
            if !is_root {
                continue;
            }
            out.push_str(name);
            out.push('\n');
            let mut path = vec![name.as_str()];
            Self::render_chain(&dependents, name, "  ", &mut path, &mut out);
        }
        out
    }

    fn render_chain<'a>(
        dependents: &HashMap<&'a str, Vec<&'a str>>,
        name: &str,
        prefix: &str,
        path: &mut Vec<&'a str>,
        out: &mut String,
    ) {
        let Some(children) = dependents.get(name) else {
            return;
        };
        for child in children {
            if path.contains(child) {
                out.push_str(&format!("{prefix}└─> {child} (cycle)\n"));
                continue;
            }
            out.push_str(&format!("{prefix}└─> {child}\n"));
            path.push(*child);
            Self::render_chain(dependents, child, &format!("{prefix}    "), path, out);
            path.pop();
        }
    }

    /// Completion order of tasks that ran in the last run.
    pub async fn execution_order(&self) -> Vec<String> {
        self.execution_order.lock().await.clone()
    }

    pub async fn run(&mut self, ctx: &RunContext) -> Result<RunSummary> {
        self.run_with_options(ctx, &RunOptions::default()).await
    }

    /// Drives the flow to completion, failure, deadlock or cancellation.
    ///
    /// Each wave runs every ready task concurrently and waits for all of
    /// them. The first failed wave ends the run; among several failures the
    /// task with the smallest name is reported. The context is checked before
    /// every wave. Dropping the returned future aborts the jobs of the wave
    /// in flight; their tasks are left `Running`.
    pub async fn run_with_options(
        &mut self,
        ctx: &RunContext,
        options: &RunOptions,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        self.execution_order.lock().await.clear();
        self.reporter.run_started(&self.name, &self.order);

        let mut unknown_skips: Vec<&String> = options
            .skip
            .iter()
            .filter(|name| !self.tasks.contains_key(*name))
            .collect();
        unknown_skips.sort();
        for name in unknown_skips {
            warn!(pipeline = %self.name, step = %name, "skip requested for unknown step");
        }

        let mut progress = Progress::default();
        let outcome = self.drive(ctx, options, &mut progress).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                self.reporter
                    .run_completed(&self.name, elapsed, progress.completed);
                let order = self.execution_order().await;
                let attempts = self
                    .tasks
                    .values()
                    .filter(|t| t.attempts() > 0)
                    .map(|t| (t.name().to_string(), t.attempts()))
                    .collect();
                progress.skipped.sort();
                Ok(RunSummary {
                    flow: self.name.clone(),
                    completed: progress.completed,
                    skipped: progress.skipped,
                    waves: progress.waves,
                    elapsed,
                    order,
                    attempts,
                })
            }
            Err(err) => {
                self.reporter
                    .run_failed(&self.name, elapsed, progress.completed, &err);
                Err(err)
            }
        }
    }

    async fn drive(
        &mut self,
        ctx: &RunContext,
        options: &RunOptions,
        progress: &mut Progress,
    ) -> Result<()> {
        loop {
            if let Some(reason) = ctx.check() {
                return Err(FlowError::Cancelled {
                    flow: self.name.clone(),
                    reason,
                });
            }

            let ready = self.find_ready_tasks();
            if ready.is_empty() {
                if self.all_done() {
                    return Ok(());
                }
                if let Some(err) = self.first_failure() {
                    return Err(err);
                }
                return Err(FlowError::Deadlock {
                    flow: self.name.clone(),
                    pending: self.pending_tasks(),
                });
            }

            let (skipped, runnable): (Vec<String>, Vec<String>) =
                ready.into_iter().partition(|name| options.skip.contains(name));

            for name in skipped {
                if let Some(task) = self.tasks.get_mut(&name) {
                    task.mark_skipped();
                    self.reporter.task_skipped(&self.name, &name);
                    progress.skipped.push(name);
                }
            }

            // Skips can unlock further tasks without any work being done.
            if runnable.is_empty() {
                continue;
            }

            progress.waves += 1;
            debug!(
                pipeline = %self.name,
                wave = progress.waves,
                tasks = ?runnable,
                "wave started"
            );

            for outcome in self.run_wave(ctx, runnable).await {
                let Some(task) = self.tasks.get_mut(&outcome.name) else {
                    continue;
                };
                match outcome.result {
                    Ok(()) => {
                        task.mark_done(outcome.attempts);
                        progress.completed += 1;
                    }
                    Err(err) => task.mark_failed(err, outcome.attempts),
                }
            }

            if let Some(err) = self.first_failure() {
                return Err(err);
            }
        }
    }

    async fn run_wave(&mut self, ctx: &RunContext, names: Vec<String>) -> Vec<TaskOutcome> {
        let wave_started = Instant::now();
        let mut handles = Vec::with_capacity(names.len());

        for name in names {
            let Some(task) = self.tasks.get_mut(&name) else {
                continue;
            };
            task.mark_running();

            let job = TaskJob {
                ctx: ctx.clone(),
                flow: self.name.clone(),
                name: name.clone(),
                work: task.work(),
                policy: task.retry_policy().unwrap_or(self.retry_policy),
                reporter: Arc::clone(&self.reporter),
                execution_order: Arc::clone(&self.execution_order),
            };
            handles.push((name, tokio::spawn(job.execute())));
        }

        let _abort_guard = AbortOnDrop(handles.iter().map(|(_, h)| h.abort_handle()).collect());

        let flow = self.name.as_str();
        let reporter = Arc::clone(&self.reporter);
        join_all(handles.into_iter().map(|(name, handle)| {
            let reporter = Arc::clone(&reporter);
            async move {
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        // The work panicked or was aborted, so the job never
                        // reported its own end.
                        let err = FlowError::TaskFailed {
                            task: name.clone(),
                            attempts: 1,
                            source: Arc::new(join_err),
                        };
                        reporter.task_failed(flow, &name, wave_started.elapsed(), &err);
                        TaskOutcome {
                            name,
                            attempts: 1,
                            result: Err(err),
                        }
                    }
                }
            }
        }))
        .await
    }

    /// Error of the failed task with the smallest name, if any task failed.
    /// The task keeps its recorded error.
    fn first_failure(&self) -> Option<FlowError> {
        self.tasks
            .values()
            .filter(|t| t.state() == TaskState::Failed)
            .min_by(|a, b| a.name().cmp(b.name()))
            .and_then(Task::error)
            .and_then(FlowError::task_error_copy)
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// Aborts the wave's spawned jobs if the run future is dropped mid-wave.
/// Jobs that already finished are unaffected.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    completed: usize,
    waves: usize,
    skipped: Vec<String>,
}

struct TaskOutcome {
    name: String,
    attempts: u32,
    result: Result<()>,
}

/// Everything one wave member needs, moved into its spawned future.
struct TaskJob {
    ctx: RunContext,
    flow: String,
    name: String,
    work: TaskFn,
    policy: RetryPolicy,
    reporter: Arc<dyn RunReporter>,
    execution_order: Arc<Mutex<Vec<String>>>,
}

impl TaskJob {
    async fn execute(self) -> TaskOutcome {
        let started = Instant::now();
        self.reporter.task_started(&self.flow, &self.name);

        let mut attempts = 0;
        let work = &self.work;
        let result = RetryExecutor::new(self.policy)
            .execute_with_retry(
                &self.ctx,
                &self.flow,
                &self.name,
                self.reporter.as_ref(),
                |attempt| {
                    attempts = attempt;
                    work()
                },
            )
            .await;

        match &result {
            Ok(()) => {
                self.execution_order.lock().await.push(self.name.clone());
                self.reporter
                    .task_completed(&self.flow, &self.name, started.elapsed());
            }
            Err(err) => {
                self.reporter
                    .task_failed(&self.flow, &self.name, started.elapsed(), err);
            }
        }

        TaskOutcome {
            name: self.name,
            attempts,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ok_flow(edges: &[(&str, &[&str])]) -> Flow {
        let mut flow = Flow::new("f");
        for (name, deps) in edges {
            flow.add_task(*name, || async { Ok(()) }, deps).unwrap();
        }
        flow
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut flow = Flow::new("f");
        flow.add_task("a", || async { Ok(()) }, &[]).unwrap();
        let err = flow.add_task("a", || async { Ok(()) }, &[]).unwrap_err();

        assert!(matches!(err, FlowError::DuplicateTask { ref task, .. } if task == "a"));
        assert_eq!(flow.task_names(), ["a".to_string()]);
    }

    #[test]
    fn registration_order_is_kept() {
        let flow = ok_flow(&[("c", &[]), ("a", &["c"]), ("b", &[])]);
        assert_eq!(flow.task_names(), ["c", "a", "b"].map(String::from));
        assert_eq!(flow.len(), 3);
    }

    #[test]
    fn ready_set_contains_only_unblocked_pending_tasks() {
        let mut flow = ok_flow(&[("a", &[]), ("b", &[]), ("c", &["a"]), ("d", &["a", "b"])]);
        assert_eq!(flow.find_ready_tasks(), vec!["a", "b"]);

        flow.tasks.get_mut("a").unwrap().mark_running();
        assert_eq!(flow.find_ready_tasks(), vec!["b"]);

        flow.tasks.get_mut("a").unwrap().mark_done(1);
        assert_eq!(flow.find_ready_tasks(), vec!["b", "c"]);
        assert!(!flow.all_done());
    }

    #[test]
    fn unknown_dependency_is_never_ready() {
        let flow = ok_flow(&[("a", &["ghost"])]);
        assert!(flow.find_ready_tasks().is_empty());
    }

    #[test]
    fn empty_flow_is_all_done() {
        assert!(Flow::new("f").all_done());
    }

    #[test]
    fn validate_reports_unknown_dependency() {
        let flow = ok_flow(&[("a", &[]), ("b", &["a", "ghost"])]);
        let err = flow.validate().unwrap_err();
        assert!(
            matches!(
                err,
                FlowError::UnknownDependency { ref task, ref dependency }
                    if task == "b" && dependency == "ghost"
            )
        );
    }

    #[test]
    fn validate_reports_cycle() {
        let flow = ok_flow(&[("a", &["b"]), ("b", &["a"])]);
        let err = flow.validate().unwrap_err();
        assert_eq!(err.to_string(), "flow f: circular dependency detected: a -> b -> a");
    }

    #[test]
    fn validate_accepts_dag() {
        let flow = ok_flow(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn render_graph_draws_trees_from_roots() {
        let flow = ok_flow(&[("fetch", &[]), ("render", &[]), ("merge", &["fetch", "render"])]);
        assert_eq!(
            flow.render_graph(),
            "fetch\n  └─> merge\nrender\n  └─> merge\n"
        );
    }

    #[test]
    fn render_graph_marks_cycles() {
        let flow = ok_flow(&[("root", &[]), ("b", &["root", "c"]), ("c", &["b"])]);
        assert_eq!(
            flow.render_graph(),
            "root\n  └─> b\n      └─> c\n          └─> b (cycle)\n"
        );
    }

    #[test]
    fn run_options_collect_skip_names() {
        let options = RunOptions::new().skip(["email", "upload"]);
        assert!(options.skip.contains("email"));
        assert!(options.skip.contains("upload"));
    }
}
