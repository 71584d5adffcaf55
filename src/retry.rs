use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TaskError;

/// Fixed-delay retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5 * 60),
        }
    }
}

/// Result of a retried operation along with how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub attempts: u32,
    pub result: Result<T, TaskError>,
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        let mut policy = policy;
        if policy.max_attempts == 0 {
            policy.max_attempts = 1;
        }
        Self { policy }
    }

    /// Runs `operation` until it succeeds, fails with an error `may_retry`
    /// refuses, or the attempt budget is spent. `on_retry` fires before each
    /// wait with the failed attempt number and its error.
    ///
    /// Cancellation never interrupts an attempt already in progress; it only
    /// prevents the next one.
    pub async fn execute_with_retry<F, Fut, T, P, R>(
        &self,
        ctx: CancellationToken,
        task_name: &str,
        may_retry: P,
        mut on_retry: R,
        mut operation: F,
    ) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
        P: Fn(&TaskError) -> bool,
        R: FnMut(u32, &TaskError),
    {
        let mut attempt = 1;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => {
                    return Attempted {
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts || !may_retry(&err) {
                return Attempted {
                    attempts: attempt,
                    result: Err(err),
                };
            }

            if ctx.is_cancelled() {
                debug!(task = task_name, attempt, "run aborted; not retrying");
                return Attempted {
                    attempts: attempt,
                    result: Err(cancelled(err)),
                };
            }

            on_retry(attempt, &err);

            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(task = task_name, attempt, "run aborted while waiting to retry");
                    return Attempted {
                        attempts: attempt,
                        result: Err(cancelled(err)),
                    };
                }
                _ = sleep(self.policy.delay) => {}
            }

            attempt += 1;
        }
    }
}

fn cancelled(last: TaskError) -> TaskError {
    TaskError::Cancelled {
        last: Box::new(last),
    }
}
