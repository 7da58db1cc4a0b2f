//! Human-in-the-loop pause for manual authentication.
//!
//! The gate is a cloneable handle. The task loop pauses it and waits; whoever
//! holds another clone (a console prompt, an HTTP hook, a test) resumes it.

use crate::agent::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPauseEvent {
    pub step_index: u32,
    pub reason: String,
    pub url: String,
    pub detected_at: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
}

impl LoginPauseEvent {
    pub fn new(step_index: u32, reason: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            step_index,
            reason: reason.into(),
            url: url.into(),
            detected_at: Utc::now(),
            resumed_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateState {
    Armed { last_resolved: Option<LoginPauseEvent> },
    Paused(LoginPauseEvent),
}

#[derive(Clone)]
pub struct LoginGate {
    tx: Arc<watch::Sender<GateState>>,
}

impl Default for LoginGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Armed { last_resolved: None });
        Self { tx: Arc::new(tx) }
    }

    pub fn is_paused(&self) -> bool {
        matches!(*self.tx.borrow(), GateState::Paused(_))
    }

    /// Pauses the gate. Returns false when a pause is already outstanding.
    pub fn pause(&self, event: LoginPauseEvent) -> bool {
        self.tx.send_if_modified(|state| match state {
            GateState::Paused(_) => false,
            GateState::Armed { .. } => {
                *state = GateState::Paused(event);
                true
            }
        })
    }

    /// Resolves the outstanding pause. A no-op returning `None` while armed.
    pub fn resume(&self) -> Option<LoginPauseEvent> {
        let mut resolved = None;
        self.tx.send_if_modified(|state| match state {
            GateState::Armed { .. } => false,
            GateState::Paused(event) => {
                let mut event = event.clone();
                event.resumed_at = Some(Utc::now());
                resolved = Some(event.clone());
                *state = GateState::Armed { last_resolved: Some(event) };
                true
            }
        });
        if let Some(ev) = &resolved {
            info!(step = ev.step_index, url = %ev.url, "login gate resumed");
        }
        resolved
    }

    /// Re-arms the gate without resolving the outstanding pause, used when a
    /// paused task is cancelled so the next task starts armed.
    pub(crate) fn clear(&self) {
        self.tx.send_if_modified(|state| match state {
            GateState::Armed { .. } => false,
            GateState::Paused(_) => {
                *state = GateState::Armed { last_resolved: None };
                true
            }
        });
    }

    /// Suspends until the gate is armed again and returns the resolved event.
    pub async fn wait_resumed(&self, cancel: &CancellationToken) -> Result<LoginPauseEvent, AgentError> {
        let mut rx = self.tx.subscribe();
        loop {
            let resolved = match &*rx.borrow_and_update() {
                GateState::Armed { last_resolved } => Some(last_resolved.clone()),
                GateState::Paused(_) => None,
            };
            if let Some(last) = resolved {
                return last.ok_or_else(|| AgentError::Other("gate was never paused".into()));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                changed = rx.changed() => {
                    changed.map_err(|_| AgentError::Other("login gate dropped".into()))?;
                }
            }
        }
    }

    /// Suspends until the gate is paused and returns the outstanding event.
    pub async fn wait_paused(&self) -> LoginPauseEvent {
        let mut rx = self.tx.subscribe();
        loop {
            if let GateState::Paused(event) = &*rx.borrow_and_update() {
                return event.clone();
            }
            // The sender lives in `self`, so `changed` cannot fail here.
            let _ = rx.changed().await;
        }
    }
}

/// Resumes the gate whenever a line is read from stdin.
pub fn resume_on_enter(gate: LoginGate) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let event = gate.wait_paused().await;
            eprintln!("\nLOGIN PAGE DETECTED");
            eprintln!("   URL: {}", event.url);
            eprintln!("   Reason: {}", event.reason);
            eprintln!("   Log in manually in the browser window, then press ENTER here.\n");
            match lines.next_line().await {
                Ok(Some(_)) => {
                    gate.resume();
                }
                Ok(None) => {
                    warn!("stdin closed; console resume disabled");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    return;
                }
            }
        }
    })
}
