use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use crate::{shared_error, FlowError, RunContext, RunReporter};

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Wait applied before every attempt after the first.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds or the policy's attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. The context is
    /// checked before every attempt and during every delay; a stopped context
    /// ends the loop with [`FlowError::TaskCancelled`] without spending an
    /// attempt. Every failed attempt except the last is handed to
    /// `reporter.task_retrying`.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: &RunContext,
        flow: &str,
        task_name: &str,
        reporter: &dyn RunReporter,
        mut operation: F,
    ) -> Result<T, FlowError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if let Some(reason) = ctx.check() {
                return Err(FlowError::TaskCancelled {
                    task: task_name.to_string(),
                    reason,
                });
            }

            let error = match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if attempt < max_attempts {
                let message = format!("{error:#}");
                reporter.task_retrying(flow, task_name, attempt, max_attempts, &message);

                if let Err(reason) = ctx.sleep(self.policy.delay).await {
                    return Err(FlowError::TaskCancelled {
                        task: task_name.to_string(),
                        reason,
                    });
                }
            }

            last_error = Some(error);
        }

        let source = last_error
            .map(shared_error)
            .unwrap_or_else(|| shared_error("no attempt was made"));

        Err(FlowError::TaskFailed {
            task: task_name.to_string(),
            attempts: max_attempts,
            source,
        })
    }
}
