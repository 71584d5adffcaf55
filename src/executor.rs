use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, RunConfig};
use crate::graph::{DependencyGraph, RunDefinition};
use crate::retry::RetryExecutor;
use crate::state::{RunReport, TaskState, TaskStatus};
use crate::task::{RunContext, Task, TaskOutput};
use crate::{DagError, TaskError};

/// Progress reported by a task worker. Only the coordinator turns these
/// into `TaskState` changes.
#[derive(Debug)]
enum TaskEvent {
    Started {
        name: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    Retrying {
        name: String,
        attempt: u32,
        error: TaskError,
    },
    Finished {
        name: String,
        attempts: u32,
        result: Result<TaskOutput, TaskError>,
        at: DateTime<Utc>,
    },
}

pub struct Engine {
    config: RunConfig,
}

impl Engine {
    pub fn new(config: RunConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Validates the definition, then runs it. Nothing reaches the warehouse
    /// when validation fails.
    pub async fn run_definition(
        &self,
        def: RunDefinition,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> Result<RunReport, DagError> {
        let graph = DependencyGraph::from_definition(def)?;
        Ok(self.run(&graph, ctx, cancel).await)
    }

    /// Runs every task of `graph` in dependency order.
    ///
    /// Cancelling `cancel` (or hitting the configured run timeout) stops new
    /// dispatches; attempts already in progress finish, and every task that
    /// never started ends `UpstreamFailed`.
    #[instrument(skip_all, fields(run_date = %ctx.run_date, tasks = graph.len()))]
    pub async fn run(
        &self,
        graph: &DependencyGraph,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        let ctx = Arc::new(ctx);
        let mut states = graph.initial_states();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TaskEvent>();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        let abort = cancel.child_token();

        let timeout = self.config.run_timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut in_flight = 0usize;
        let mut aborted = false;

        info!("starting run");

        loop {
            if !aborted && abort.is_cancelled() {
                aborted = true;
                warn!(in_flight, "run cancelled; waiting for in-flight attempts");
            }
            if !aborted {
                for task in graph.ready_tasks(&states) {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    if let Some(state) = states.get_mut(&task.name) {
                        state.status = TaskStatus::Ready;
                    }
                    info!(task = %task.name, kind = task.kind.label(), "dispatching task");
                    self.spawn_task(
                        task.clone(),
                        Arc::clone(&ctx),
                        abort.clone(),
                        event_tx.clone(),
                        permit,
                    );
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    if record(graph, &mut states, event) {
                        in_flight -= 1;
                    }
                }
                _ = abort.cancelled(), if !aborted => {
                    aborted = true;
                    warn!(in_flight, "run cancelled; waiting for in-flight attempts");
                }
                _ = &mut deadline, if !aborted => {
                    aborted = true;
                    abort.cancel();
                    warn!(in_flight, "run timed out; waiting for in-flight attempts");
                }
            }
        }

        let now = Utc::now();
        for (name, state) in states.iter_mut() {
            if !state.status.is_terminal() {
                debug!(task = %name, "never dispatched");
                state.status = TaskStatus::UpstreamFailed;
                state.finished_at = Some(now);
            }
        }

        let states: BTreeMap<String, TaskState> = states.into_iter().collect();
        let report = RunReport::from_states(states, aborted, started.elapsed());
        if report.is_success() {
            info!(elapsed = ?report.elapsed, "run succeeded");
        } else {
            error!(
                failed = report.failed.len(),
                upstream_failed = report.upstream_failed.len(),
                aborted,
                "run failed"
            );
        }
        report
    }

    fn spawn_task(
        &self,
        task: Task,
        ctx: Arc<RunContext>,
        abort: CancellationToken,
        events: mpsc::UnboundedSender<TaskEvent>,
        permit: OwnedSemaphorePermit,
    ) {
        let retry = RetryExecutor::new(self.config.retry_policy());

        tokio::spawn(async move {
            let name = task.name.clone();
            let (task_ref, ctx_ref, events_ref, name_ref) = (&task, &*ctx, &events, &name);

            let attempted = retry
                .execute_with_retry(
                    abort,
                    name_ref,
                    |e| task_ref.may_retry(e),
                    move |attempt, e| {
                        let _ = events_ref.send(TaskEvent::Retrying {
                            name: name_ref.clone(),
                            attempt,
                            error: e.clone(),
                        });
                    },
                    move |attempt| {
                        let _ = events_ref.send(TaskEvent::Started {
                            name: name_ref.clone(),
                            attempt,
                            at: Utc::now(),
                        });
                        async move {
                            AssertUnwindSafe(task_ref.run(ctx_ref))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic))))
                        }
                    },
                )
                .await;

            let at = Utc::now();
            // Release the slot before reporting so the coordinator can
            // dispatch a successor as soon as it hears about this one.
            drop(permit);
            let _ = events.send(TaskEvent::Finished {
                name,
                attempts: attempted.attempts,
                result: attempted.result,
                at,
            });
        });
    }
}

/// Applies one worker event. Returns `true` once the task is done.
fn record(
    graph: &DependencyGraph,
    states: &mut HashMap<String, TaskState>,
    event: TaskEvent,
) -> bool {
    match event {
        TaskEvent::Started { name, attempt, at } => {
            debug!(task = %name, attempt, "attempt started");
            if let Some(state) = states.get_mut(&name) {
                state.status = TaskStatus::Running;
                state.attempts = attempt;
                state.started_at.get_or_insert(at);
            }
            false
        }
        TaskEvent::Retrying {
            name,
            attempt,
            error,
        } => {
            warn!(task = %name, attempt, error = %error, "attempt failed; will retry");
            if let Some(state) = states.get_mut(&name) {
                state.status = TaskStatus::Ready;
                state.last_error = Some(error);
            }
            false
        }
        TaskEvent::Finished {
            name,
            attempts,
            result,
            at,
        } => {
            let optional = graph.get(&name).is_some_and(|t| t.optional);
            let Some(state) = states.get_mut(&name) else {
                return true;
            };
            state.attempts = attempts;
            state.finished_at = Some(at);

            match result {
                Ok(output) => {
                    info!(task = %name, attempts, ?output, "task succeeded");
                    state.status = TaskStatus::Succeeded;
                }
                Err(e) if optional => {
                    warn!(task = %name, attempts, error = %e, "optional task failed; skipping");
                    state.status = TaskStatus::Skipped;
                    state.last_error = Some(e);
                }
                Err(e) => {
                    error!(task = %name, attempts, error = %e, "task failed");
                    state.status = TaskStatus::Failed;
                    state.last_error = Some(e);
                }
            }

            if state.status.blocks_downstream() {
                for downstream in graph.downstream_of(&name) {
                    if let Some(state) = states.get_mut(&downstream) {
                        if state.status == TaskStatus::Pending {
                            warn!(task = %downstream, upstream = %name, "upstream failed");
                            state.status = TaskStatus::UpstreamFailed;
                            state.finished_at = Some(at);
                        }
                    }
                }
            }
            true
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
