use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    UpstreamFailed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::UpstreamFailed | Self::Skipped
        )
    }

    /// Terminal states that block every downstream task.
    pub fn blocks_downstream(self) -> bool {
        matches!(self, Self::Failed | Self::UpstreamFailed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::UpstreamFailed => "upstream_failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime record of one task within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub name: String,
    pub attempts: u32,
    pub error: Option<TaskError>,
}

/// Outcome of a whole run, shaped for whatever reports on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub aborted: bool,
    pub states: BTreeMap<String, TaskState>,
    /// Root causes: tasks that ran and ended `Failed`.
    pub failed: Vec<FailedTask>,
    /// Blast radius: tasks never attempted because something upstream failed.
    pub upstream_failed: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub(crate) fn from_states(
        states: BTreeMap<String, TaskState>,
        aborted: bool,
        elapsed: Duration,
    ) -> Self {
        let mut failed = Vec::new();
        let mut upstream_failed = Vec::new();
        for (name, state) in &states {
            match state.status {
                TaskStatus::Failed => failed.push(FailedTask {
                    name: name.clone(),
                    attempts: state.attempts,
                    error: state.last_error.clone(),
                }),
                TaskStatus::UpstreamFailed => upstream_failed.push(name.clone()),
                _ => {}
            }
        }

        let all_ok = states
            .values()
            .all(|s| matches!(s.status, TaskStatus::Succeeded | TaskStatus::Skipped));
        let status = if all_ok && !aborted {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        Self {
            status,
            aborted,
            states,
            failed,
            upstream_failed,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn status_of(&self, task: &str) -> Option<TaskStatus> {
        self.states.get(task).map(|s| s.status)
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "run {} in {:.1}s{}\n",
            match self.status {
                RunStatus::Succeeded => "succeeded",
                RunStatus::Failed => "failed",
            },
            self.elapsed.as_secs_f64(),
            if self.aborted { " (aborted)" } else { "" }
        );
        for (name, state) in &self.states {
            out.push_str(&format!(
                "  {name}: {} (attempts: {})\n",
                state.status, state.attempts
            ));
        }
        for f in &self.failed {
            match &f.error {
                Some(e) => out.push_str(&format!("failed {}: {e}\n", f.name)),
                None => out.push_str(&format!("failed {}\n", f.name)),
            }
        }
        if !self.upstream_failed.is_empty() {
            out.push_str(&format!(
                "not attempted due to upstream failure: {}\n",
                self.upstream_failed.join(", ")
            ));
        }
        out
    }
}
