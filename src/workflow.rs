use crate::gate::LoginPauseEvent;
use crate::recorder::StepRecord;
use crate::task::{AppProfile, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Steps,
    Time,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    ConstraintViolation(String),
    ExecutionError(String),
    CaptureUnavailable(String),
    BudgetExceeded(Budget),
    Cancelled,
    /// The step log could not be persisted or an invariant check failed.
    Internal(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ConstraintViolation(m) => write!(f, "constraint violation: {m}"),
            FailureReason::ExecutionError(m) => write!(f, "execution error: {m}"),
            FailureReason::CaptureUnavailable(m) => write!(f, "capture unavailable: {m}"),
            FailureReason::BudgetExceeded(Budget::Steps) => f.write_str("step budget exceeded"),
            FailureReason::BudgetExceeded(Budget::Time) => f.write_str("time budget exceeded"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed { failure: FailureReason },
}

impl TaskOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        TaskOutcome::Failed { failure: reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDataset {
    pub task_id: String,
    pub task: String,
    pub instructions: String,
    pub app: AppProfile,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_duration_secs: f64,
    pub success: bool,
    pub outcome: TaskOutcome,
    pub steps: Vec<StepRecord>,
    pub login_pauses: Vec<LoginPauseEvent>,
    pub final_result: Option<String>,
    pub error_summary: Option<String>,
}

/// The per-task inputs the assembler needs besides the steps themselves.
pub struct TaskMeta<'a> {
    pub task: &'a Task,
    pub started_at: DateTime<Utc>,
}

pub struct WorkflowAssembler;

impl WorkflowAssembler {
    pub fn finalize(
        meta: TaskMeta<'_>,
        steps: Vec<StepRecord>,
        outcome: TaskOutcome,
        login_pauses: Vec<LoginPauseEvent>,
        final_result: Option<String>,
    ) -> WorkflowDataset {
        let completed_at = Utc::now();
        let total = (completed_at - meta.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let error_summary = match &outcome {
            TaskOutcome::Completed => None,
            TaskOutcome::Failed { failure } => Some(failure.to_string()),
        };
        WorkflowDataset {
            task_id: meta.task.id.clone(),
            task: meta.task.query.clone(),
            instructions: meta.task.instructions.clone(),
            app: meta.task.app.clone(),
            started_at: meta.started_at,
            completed_at,
            total_duration_secs: total,
            success: outcome.is_success(),
            outcome,
            steps,
            login_pauses,
            final_result,
            error_summary,
        }
    }
}
