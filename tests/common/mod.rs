#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

use taskflow::{Flow, RecordingReporter, RetryPolicy};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Uses `with_test_writer()`, so output only shows for failing tests unless
/// run with `-- --nocapture`. Enable levels with e.g. `RUST_LOG=debug`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// A flow wired to an in-memory reporter, without retry delays.
pub fn recorded_flow(name: &str) -> (Flow, Arc<RecordingReporter>) {
    init_tracing();
    let reporter = Arc::new(RecordingReporter::new());
    let flow = Flow::new(name)
        .with_retry_policy(RetryPolicy::none())
        .with_reporter(reporter.clone());
    (flow, reporter)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Finish,
}

/// Ordered log of task starts and finishes, written by the task bodies.
#[derive(Clone, Default)]
pub struct Timeline {
    log: Arc<Mutex<Vec<(String, Phase)>>>,
}

impl Timeline {
    pub fn start(&self, task: &str) {
        self.log.lock().unwrap().push((task.to_string(), Phase::Start));
    }

    pub fn finish(&self, task: &str) {
        self.log.lock().unwrap().push((task.to_string(), Phase::Finish));
    }

    fn position(&self, task: &str, phase: Phase) -> Option<usize> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .position(|(t, p)| t == task && *p == phase)
    }

    pub fn started_at(&self, task: &str) -> Option<usize> {
        self.position(task, Phase::Start)
    }

    pub fn finished_at(&self, task: &str) -> Option<usize> {
        self.position(task, Phase::Finish)
    }

    pub fn start_count(&self, task: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, p)| t == task && *p == Phase::Start)
            .count()
    }

    pub fn starts(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| *p == Phase::Start)
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn ran(&self, task: &str) -> bool {
        self.started_at(task).is_some()
    }
}

/// Adds a task that logs itself on `timeline` and sleeps for `work_ms`.
pub fn add_logged(flow: &mut Flow, timeline: &Timeline, name: &str, work_ms: u64, deps: &[&str]) {
    let timeline = timeline.clone();
    let task = name.to_string();
    flow.add_task(
        name,
        move || {
            let timeline = timeline.clone();
            let task = task.clone();
            async move {
                timeline.start(&task);
                tokio::time::sleep(Duration::from_millis(work_ms)).await;
                timeline.finish(&task);
                Ok(())
            }
        },
        deps,
    )
    .unwrap();
}
