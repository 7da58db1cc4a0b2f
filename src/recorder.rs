use crate::agent::{Action, AgentError};
use crate::snapshot::{Fingerprint, Snapshot};
use crate::store::WorkflowStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    ConstraintViolation,
    ExecutionError,
    CaptureUnavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    pub action: Action,
    pub rationale: Option<String>,
    pub description: String,
    /// Absent when the step failed before a trustworthy state could be captured.
    pub snapshot: Option<Snapshot>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<StepError>,
    /// First state accepted after a manual login.
    #[serde(default)]
    pub after_login: bool,
}

/// Everything the loop knows about a step before an index is assigned.
pub struct StepEntry {
    pub action: Action,
    pub rationale: Option<String>,
    pub snapshot: Option<Snapshot>,
    pub duration: Duration,
    pub error: Option<StepError>,
    pub after_login: bool,
}

impl StepEntry {
    pub fn accepted(action: Action, rationale: Option<String>, snapshot: Snapshot, duration: Duration) -> Self {
        Self { action, rationale, snapshot: Some(snapshot), duration, error: None, after_login: false }
    }

    pub fn failed(action: Action, rationale: Option<String>, error: StepError, duration: Duration) -> Self {
        Self { action, rationale, snapshot: None, duration, error: Some(error), after_login: false }
    }
}

/// Append-only log of a single task's steps.
pub struct StepRecorder {
    task_id: String,
    store: Arc<dyn WorkflowStore>,
    steps: Vec<StepRecord>,
    last_fingerprint: Option<Fingerprint>,
}

impl StepRecorder {
    pub fn new(task_id: impl Into<String>, store: Arc<dyn WorkflowStore>) -> Self {
        Self { task_id: task_id.into(), store, steps: Vec::new(), last_fingerprint: None }
    }

    pub fn next_index(&self) -> u32 {
        self.steps.len() as u32 + 1
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<StepRecord> {
        self.steps
    }

    /// Persists and appends the next step. The index is only consumed once the
    /// store has accepted the record.
    pub async fn record(&mut self, entry: StepEntry) -> Result<&StepRecord, AgentError> {
        let success = entry.error.is_none();
        if success {
            if let (Some(prev), Some(snap)) = (&self.last_fingerprint, &entry.snapshot) {
                if *prev == snap.fingerprint {
                    return Err(AgentError::DuplicateState(snap.fingerprint.to_string()));
                }
            }
        }
        let record = StepRecord {
            index: self.next_index(),
            description: entry.action.describe(),
            action: entry.action,
            rationale: entry.rationale,
            snapshot: entry.snapshot,
            duration_ms: entry.duration.as_millis() as u64,
            success,
            error: entry.error,
            after_login: entry.after_login,
        };
        self.store.write_step(&self.task_id, &record).await?;
        if let (true, Some(snap)) = (success, &record.snapshot) {
            self.last_fingerprint = Some(snap.fingerprint.clone());
        }
        info!(
            step = record.index,
            action = %record.description,
            success,
            url = record.snapshot.as_ref().map(|s| s.url.as_str()).unwrap_or("-"),
            "step recorded"
        );
        self.steps.push(record);
        Ok(&self.steps[self.steps.len() - 1])
    }
}
