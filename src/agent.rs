use crate::detect::{ChangeDetector, Classification};
use crate::gate::{LoginGate, LoginPauseEvent};
use crate::recorder::{StepEntry, StepError, StepErrorKind, StepRecorder};
use crate::snapshot::{Captured, Snapshot, SnapshotBuilder};
use crate::store::{CaptureStore, NullStore, WorkflowStore};
use crate::task::{ConstraintSet, Task};
use crate::workflow::{Budget, FailureReason, TaskMeta, TaskOutcome, WorkflowAssembler, WorkflowDataset};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ========================= Core Types =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { target: Locator },
    Type {
        text: String,
        #[serde(default)]
        into: Option<Locator>,
    },
    Key { combo: String },
    Hover { target: Locator },
    Scroll { dx: i32, dy: i32 },
    Navigate { url: String },
    Wait { ms: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Key,
    Hover,
    Scroll,
    Navigate,
    Wait,
}

impl ActionKind {
    pub fn all() -> BTreeSet<ActionKind> {
        [
            ActionKind::Click,
            ActionKind::Type,
            ActionKind::Key,
            ActionKind::Hover,
            ActionKind::Scroll,
            ActionKind::Navigate,
            ActionKind::Wait,
        ]
        .into_iter()
        .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    Css { selector: String },
    XPath { expr: String },
    Text { pattern: String },
    Coordinates { x: i32, y: i32 },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { .. } => ActionKind::Click,
            Action::Type { .. } => ActionKind::Type,
            Action::Key { .. } => ActionKind::Key,
            Action::Hover { .. } => ActionKind::Hover,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::Wait { .. } => ActionKind::Wait,
        }
    }

    pub fn target(&self) -> Option<&Locator> {
        match self {
            Action::Click { target } | Action::Hover { target } => Some(target),
            Action::Type { into, .. } => into.as_ref(),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<String> {
        match self {
            Action::Type { text, .. } => Some(text.clone()),
            Action::Key { combo } => Some(combo.clone()),
            Action::Navigate { url } => Some(url.clone()),
            Action::Scroll { dx, dy } => Some(format!("{dx},{dy}")),
            Action::Wait { ms } => Some(ms.to_string()),
            Action::Click { .. } | Action::Hover { .. } => None,
        }
    }

    /// One-line summary kept on every step record.
    pub fn describe(&self) -> String {
        let mut s = format!("{:?}", self.kind()).to_lowercase();
        if let Some(target) = self.target() {
            s.push(' ');
            s.push_str(&match target {
                Locator::Css { selector } => selector.clone(),
                Locator::XPath { expr } => expr.clone(),
                Locator::Text { pattern } => format!("'{pattern}'"),
                Locator::Coordinates { x, y } => format!("({x}, {y})"),
            });
        }
        if let Some(payload) = self.payload() {
            s.push_str(": ");
            s.push_str(&payload);
        }
        s.chars().take(200).collect()
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("computer error: {0}")]
    Computer(String),
    #[error("reasoner error: {0}")]
    Reasoner(String),
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("duplicate state: {0}")]
    DuplicateState(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("cancelled")]
    Cancelled,
    #[error("other error: {0}")]
    Other(String),
}

/// What the reasoner sees when asked for the next action.
pub struct Observation<'a> {
    pub task: &'a Task,
    pub constraints: &'a ConstraintSet,
    /// Latest accepted state, or the initial page state before the first step.
    pub snapshot: &'a Snapshot,
    pub screenshot: Option<&'a [u8]>,
    /// Consecutive actions that produced no visible change.
    pub no_op_count: u32,
    pub stalled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "proposal", rename_all = "snake_case")]
pub enum Proposal {
    Act { action: Action, rationale: Option<String> },
    Done { summary: Option<String> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

// ========================= Pluggable Subsystems =========================

/// Read access to a settled page.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn url(&self) -> Result<String, AgentError>;
    async fn title(&self) -> Result<String, AgentError>;
    async fn text_excerpt(&self) -> Result<String, AgentError>;
    /// Whether a password or one-time-code input is visible.
    async fn has_credential_input(&self) -> Result<bool, AgentError>;
    async fn screenshot_png(&self) -> Result<Vec<u8>, AgentError>;
}

/// The live browser session. `execute` must not return before the page is settled.
#[async_trait]
pub trait Computer: Send + Sync {
    type Page: PageHandle + 'static;

    async fn open_url(&self, url: &str) -> Result<Self::Page, AgentError>;
    async fn current_page(&self) -> Result<Self::Page, AgentError>;
    async fn execute(&self, action: &Action) -> Result<Self::Page, AgentError>;
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn propose(&self, observation: &Observation<'_>) -> Result<Proposal, AgentError>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Actions issued per task before the task fails with a budget error.
    pub max_steps: u32,
    pub max_duration: Option<Duration>,
    pub reasoner_timeout: Duration,
    pub action_timeout: Duration,
    /// No-op count at which the reasoner is told it is stalled.
    pub stall_threshold: Option<u32>,
    pub excerpt_limit: usize,
    pub pause_between_tasks: Duration,
    pub output_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_duration: None,
            reasoner_timeout: Duration::from_secs(90),
            action_timeout: Duration::from_secs(150),
            stall_threshold: Some(3),
            excerpt_limit: 4000,
            pause_between_tasks: Duration::from_secs(2),
            output_dir: PathBuf::from("ui_dataset"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_steps: env_parse("FLOWCAP_MAX_STEPS").unwrap_or(d.max_steps),
            max_duration: env_parse("FLOWCAP_MAX_DURATION_SECS")
                .map(Duration::from_secs)
                .or(d.max_duration),
            reasoner_timeout: env_parse("FLOWCAP_REASONER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.reasoner_timeout),
            action_timeout: env_parse("FLOWCAP_ACTION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.action_timeout),
            // 0 disables the stall hint
            stall_threshold: match env_parse::<u32>("FLOWCAP_STALL_THRESHOLD") {
                Some(0) => None,
                Some(n) => Some(n),
                None => d.stall_threshold,
            },
            output_dir: env::var("FLOWCAP_OUTPUT_DIR").map(PathBuf::from).unwrap_or(d.output_dir),
            ..d
        }
    }
}

/// Drives tasks through one shared browser session.
pub struct Agent<C, R>
where
    C: Computer,
    R: Reasoner,
{
    computer: C,
    reasoner: R,
    cfg: AgentConfig,
    detector: ChangeDetector,
    gate: LoginGate,
    cancel: CancellationToken,
    captures: Arc<dyn CaptureStore>,
    workflows: Arc<dyn WorkflowStore>,
    state: watch::Sender<LoopState>,
}

struct Finish {
    outcome: TaskOutcome,
    final_result: Option<String>,
}

impl Finish {
    fn failed(reason: FailureReason) -> Self {
        Self { outcome: TaskOutcome::failed(reason), final_result: None }
    }
}

/// Mutable state of the task currently on the loop.
struct TaskRun {
    builder: SnapshotBuilder,
    recorder: StepRecorder,
    pauses: Vec<LoginPauseEvent>,
    accepted: Option<Snapshot>,
    observed: Option<Snapshot>,
    last_png: Option<Vec<u8>>,
    no_ops: u32,
    issued: u32,
    after_login: bool,
}

impl TaskRun {
    async fn fail_step(
        &mut self,
        action: Action,
        rationale: Option<String>,
        error: StepError,
        started: Instant,
    ) -> Finish {
        let reason = match error.kind {
            StepErrorKind::ConstraintViolation => FailureReason::ConstraintViolation(error.message.clone()),
            StepErrorKind::ExecutionError => FailureReason::ExecutionError(error.message.clone()),
            StepErrorKind::CaptureUnavailable => FailureReason::CaptureUnavailable(error.message.clone()),
        };
        let entry = StepEntry::failed(action, rationale, error, started.elapsed());
        match self.recorder.record(entry).await {
            Ok(_) => Finish::failed(reason),
            Err(e) => Finish::failed(FailureReason::Internal(e.to_string())),
        }
    }
}

impl<C, R> Agent<C, R>
where
    C: Computer,
    R: Reasoner,
{
    pub fn new(computer: C, reasoner: R, cfg: AgentConfig) -> Self {
        let (state, _rx) = watch::channel(LoopState::Idle);
        Self {
            computer,
            reasoner,
            cfg,
            detector: ChangeDetector::default(),
            gate: LoginGate::new(),
            cancel: CancellationToken::new(),
            captures: Arc::new(NullStore),
            workflows: Arc::new(NullStore),
            state,
        }
    }

    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: CaptureStore + WorkflowStore + 'static,
    {
        self.captures = store.clone();
        self.workflows = store;
        self
    }

    pub fn with_detector(mut self, detector: ChangeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for whoever resumes after a manual login.
    pub fn login_gate(&self) -> LoginGate {
        self.gate.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn computer(&self) -> &C {
        &self.computer
    }

    fn set_state(&self, next: LoopState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "loop state");
        }
    }

    /// Runs tasks one after another over the shared session.
    pub async fn run_all(&mut self, tasks: &[Task]) -> Vec<WorkflowDataset> {
        let mut datasets = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if i > 0 && !self.cfg.pause_between_tasks.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.cfg.pause_between_tasks) => {}
                }
            }
            if self.cancel.is_cancelled() {
                warn!(remaining = tasks.len() - i, "run cancelled, skipping remaining tasks");
                break;
            }
            match self.run_task(task).await {
                Ok(ds) => datasets.push(ds),
                Err(e) => warn!(task_id = %task.id, error = %e, "task could not be finalized"),
            }
        }
        datasets
    }

    /// Runs one task to completion or failure and returns its finalized dataset.
    pub async fn run_task(&mut self, task: &Task) -> Result<WorkflowDataset, AgentError> {
        let started_at = Utc::now();
        self.workflows.write_task_start(task).await?;
        info!(task_id = %task.id, app = %task.app.name, "task started");
        self.set_state(LoopState::Running);

        let mut run = TaskRun {
            builder: SnapshotBuilder::new(self.captures.clone(), task.id.clone(), self.cfg.excerpt_limit),
            recorder: StepRecorder::new(task.id.clone(), self.workflows.clone()),
            pauses: Vec::new(),
            accepted: None,
            observed: None,
            last_png: None,
            no_ops: 0,
            issued: 0,
            after_login: false,
        };
        let finish = self.drive(task, &mut run).await;
        if matches!(finish.outcome, TaskOutcome::Failed { failure: FailureReason::Cancelled }) {
            self.gate.clear();
        }
        self.set_state(if finish.outcome.is_success() {
            LoopState::Completed
        } else {
            LoopState::Failed
        });

        let dataset = WorkflowAssembler::finalize(
            TaskMeta { task, started_at },
            run.recorder.into_steps(),
            finish.outcome,
            run.pauses,
            finish.final_result,
        );
        match &dataset.error_summary {
            None => info!(task_id = %task.id, steps = dataset.steps.len(), "task completed"),
            Some(err) => warn!(task_id = %task.id, steps = dataset.steps.len(), error = %err, "task failed"),
        }
        self.workflows.write_task_end(&dataset).await?;
        Ok(dataset)
    }

    /// Awaits a collaborator call under a timeout while watching for cancellation.
    async fn guarded<T, F>(&self, limit: Duration, what: &str, fut: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(limit, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(AgentError::Timeout(format!("{what} exceeded {limit:?}"))),
            },
        }
    }

    /// Blocks on the login gate, then hands back a fresh page.
    async fn pause_for_login(
        &self,
        run: &mut TaskRun,
        event: LoginPauseEvent,
    ) -> Result<C::Page, AgentError> {
        warn!(step = event.step_index, url = %event.url, reason = %event.reason, "login required, pausing");
        self.gate.pause(event);
        self.set_state(LoopState::Paused);
        let resolved = self.gate.wait_resumed(&self.cancel).await?;
        run.pauses.push(resolved);
        run.after_login = true;
        self.set_state(LoopState::Running);
        self.guarded(self.cfg.action_timeout, "current page", self.computer.current_page())
            .await
            .map_err(|e| match e {
                AgentError::Cancelled => e,
                other => AgentError::CaptureUnavailable(other.to_string()),
            })
    }

    /// Captures the page the task starts on, pausing first if it is a sign-in page.
    async fn observe_initial(&self, task: &Task, run: &mut TaskRun) -> Result<Captured, Finish> {
        let opened = match &task.start_url {
            Some(url) => self.guarded(self.cfg.action_timeout, "open url", self.computer.open_url(url)).await,
            None => self.guarded(self.cfg.action_timeout, "current page", self.computer.current_page()).await,
        };
        let mut page = match opened {
            Ok(p) => p,
            Err(AgentError::Cancelled) => return Err(Finish::failed(FailureReason::Cancelled)),
            Err(e) => return Err(Finish::failed(FailureReason::ExecutionError(e.to_string()))),
        };
        loop {
            let captured = run
                .builder
                .capture(&page)
                .await
                .map_err(|e| Finish::failed(FailureReason::CaptureUnavailable(e.to_string())))?;
            let rule = match self.detector.login_rule(&captured.snapshot) {
                Some(rule) if task.constraints.stop_on_login => rule.to_string(),
                _ => return Ok(captured),
            };
            run.builder.discard(&captured.snapshot).await;
            let event = LoginPauseEvent::new(run.recorder.next_index(), rule, captured.snapshot.url.clone());
            page = match self.pause_for_login(run, event).await {
                Ok(p) => p,
                Err(AgentError::Cancelled) => return Err(Finish::failed(FailureReason::Cancelled)),
                Err(e) => return Err(Finish::failed(FailureReason::CaptureUnavailable(e.to_string()))),
            };
        }
    }

    async fn drive(&self, task: &Task, run: &mut TaskRun) -> Finish {
        let clock = Instant::now();
        match self.observe_initial(task, run).await {
            Ok(initial) => {
                run.observed = Some(initial.snapshot);
                run.last_png = Some(initial.png);
            }
            Err(finish) => return finish,
        }

        loop {
            if self.cancel.is_cancelled() {
                return Finish::failed(FailureReason::Cancelled);
            }
            if let Some(max) = self.cfg.max_duration {
                if clock.elapsed() >= max {
                    return Finish::failed(FailureReason::BudgetExceeded(Budget::Time));
                }
            }

            let Some(current) = run.accepted.as_ref().or(run.observed.as_ref()) else {
                return Finish::failed(FailureReason::Internal("no observed state".into()));
            };
            let current_url = current.url.clone();
            let observation = Observation {
                task,
                constraints: &task.constraints,
                snapshot: current,
                screenshot: run.last_png.as_deref(),
                no_op_count: run.no_ops,
                stalled: self.cfg.stall_threshold.is_some_and(|t| run.no_ops >= t),
            };
            let proposal = self
                .guarded(self.cfg.reasoner_timeout, "reasoner", self.reasoner.propose(&observation))
                .await;
            let (action, rationale) = match proposal {
                Ok(Proposal::Done { summary }) => {
                    info!(task_id = %task.id, steps = run.recorder.steps().len(), "reasoner signalled done");
                    return Finish { outcome: TaskOutcome::Completed, final_result: summary };
                }
                Ok(Proposal::Act { action, rationale }) => (action, rationale),
                Err(AgentError::Cancelled) => return Finish::failed(FailureReason::Cancelled),
                Err(e) => {
                    warn!(error = %e, "reasoner failed");
                    return Finish::failed(FailureReason::ExecutionError(e.to_string()));
                }
            };

            let started = Instant::now();
            let action = match task.constraints.check(&action, &current_url) {
                Ok(resolved) => resolved,
                Err(violation) => {
                    warn!(action = %action.describe(), %violation, "constraint violation");
                    let error = StepError::new(StepErrorKind::ConstraintViolation, violation.to_string());
                    return run.fail_step(action, rationale, error, started).await;
                }
            };
            if run.issued >= self.cfg.max_steps {
                return Finish::failed(FailureReason::BudgetExceeded(Budget::Steps));
            }

            run.issued += 1;
            info!(issued = run.issued, action = %action.describe(), "executing");
            let mut page = match self
                .guarded(self.cfg.action_timeout, "action", self.computer.execute(&action))
                .await
            {
                Ok(page) => page,
                Err(AgentError::Cancelled) => return Finish::failed(FailureReason::Cancelled),
                Err(e) => {
                    warn!(error = %e, "action failed");
                    let error = StepError::new(StepErrorKind::ExecutionError, e.to_string());
                    return run.fail_step(action, rationale, error, started).await;
                }
            };

            let mut resumed = false;
            loop {
                let captured = match run.builder.capture(&page).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "capture failed");
                        let error = StepError::new(StepErrorKind::CaptureUnavailable, e.to_string());
                        return run.fail_step(action, rationale, error, started).await;
                    }
                };
                // Login rules apply to every post-action capture, including the first one.
                let classification = match (run.accepted.as_ref(), self.detector.login_rule(&captured.snapshot)) {
                    (None, Some(rule)) => Classification::LoginRequired { rule: rule.clone() },
                    (previous, _) => self.detector.classify(previous, &captured.snapshot),
                };
                let classification = match classification {
                    Classification::LoginRequired { .. } if !task.constraints.stop_on_login => {
                        Classification::Changed
                    }
                    other => other,
                };
                match classification {
                    Classification::Unchanged => {
                        run.builder.discard(&captured.snapshot).await;
                        if !resumed {
                            run.no_ops += 1;
                        }
                        debug!(no_ops = run.no_ops, resumed, "state unchanged");
                        break;
                    }
                    Classification::Changed => {
                        let mut entry = StepEntry::accepted(
                            action.clone(),
                            rationale.clone(),
                            captured.snapshot.clone(),
                            started.elapsed(),
                        );
                        entry.after_login = run.after_login;
                        if let Err(e) = run.recorder.record(entry).await {
                            return Finish::failed(FailureReason::Internal(e.to_string()));
                        }
                        run.after_login = false;
                        run.no_ops = 0;
                        run.accepted = Some(captured.snapshot);
                        run.last_png = Some(captured.png);
                        break;
                    }
                    Classification::LoginRequired { rule } => {
                        run.builder.discard(&captured.snapshot).await;
                        let event = LoginPauseEvent::new(
                            run.recorder.next_index(),
                            rule.to_string(),
                            captured.snapshot.url.clone(),
                        );
                        page = match self.pause_for_login(run, event).await {
                            Ok(p) => p,
                            Err(AgentError::Cancelled) => return Finish::failed(FailureReason::Cancelled),
                            Err(e) => {
                                let error = StepError::new(StepErrorKind::CaptureUnavailable, e.to_string());
                                return run.fail_step(action, rationale, error, started).await;
                            }
                        };
                        resumed = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_accessors_expose_kind_target_payload() {
        let a = Action::Type { text: "Sprint Tracker".into(), into: Some(Locator::Css { selector: "#name".into() }) };
        assert_eq!(a.kind(), ActionKind::Type);
        assert_eq!(a.target(), Some(&Locator::Css { selector: "#name".into() }));
        assert_eq!(a.payload().as_deref(), Some("Sprint Tracker"));
        assert_eq!(a.describe(), "type #name: Sprint Tracker");
    }

    #[test]
    fn actions_decode_from_tagged_json() {
        let v = serde_json::json!({"type": "click", "target": {"by": "text", "pattern": "New project"}});
        let a: Action = serde_json::from_value(v).unwrap();
        assert_eq!(a, Action::Click { target: Locator::Text { pattern: "New project".into() } });

        let v = serde_json::json!({"type": "type", "text": "hello"});
        let a: Action = serde_json::from_value(v).unwrap();
        assert_eq!(a.target(), None);
    }

    #[test]
    fn describe_is_capped() {
        let a = Action::Type { text: "x".repeat(500), into: None };
        assert_eq!(a.describe().chars().count(), 200);
    }
}
