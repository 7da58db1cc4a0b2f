//! Scripted collaborators for driving the task loop without a browser or model.

#![allow(dead_code)]

use async_trait::async_trait;
use flowcap::agent::{Action, AgentError, Computer, Observation, PageHandle, Proposal, Reasoner};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub text: String,
    pub credential_input: bool,
    pub broken: bool,
}

pub fn page(url: &str, title: &str, text: &str) -> PageState {
    PageState {
        url: url.to_string(),
        title: title.to_string(),
        text: text.to_string(),
        credential_input: false,
        broken: false,
    }
}

impl PageState {
    pub fn into_credential(mut self) -> Self {
        self.credential_input = true;
        self
    }
}

pub fn broken_page() -> PageState {
    PageState { broken: true, ..page("about:blank", "", "") }
}

#[async_trait]
impl PageHandle for PageState {
    async fn url(&self) -> Result<String, AgentError> {
        if self.broken {
            return Err(AgentError::Computer("target closed".into()));
        }
        Ok(self.url.clone())
    }

    async fn title(&self) -> Result<String, AgentError> {
        Ok(self.title.clone())
    }

    async fn text_excerpt(&self) -> Result<String, AgentError> {
        Ok(self.text.clone())
    }

    async fn has_credential_input(&self) -> Result<bool, AgentError> {
        Ok(self.credential_input)
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, AgentError> {
        Ok(format!("png:{}:{}", self.url, self.text).into_bytes())
    }
}

struct ComputerInner {
    current: PageState,
    outcomes: VecDeque<Result<PageState, String>>,
    executed: Vec<Action>,
}

/// Replays a fixed list of page transitions, one per executed action.
#[derive(Clone)]
pub struct ScriptedComputer {
    inner: Arc<Mutex<ComputerInner>>,
    delay: Option<Duration>,
}

impl ScriptedComputer {
    pub fn new(initial: PageState, outcomes: Vec<Result<PageState, String>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ComputerInner {
                current: initial,
                outcomes: outcomes.into(),
                executed: Vec::new(),
            })),
            delay: None,
        }
    }

    /// Makes every executed action take `delay` before the page settles.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<Action> {
        self.inner.lock().unwrap().executed.clone()
    }

    /// Simulates the page changing underneath, e.g. while a human logs in.
    pub fn set_current(&self, state: PageState) {
        self.inner.lock().unwrap().current = state;
    }
}

#[async_trait]
impl Computer for ScriptedComputer {
    type Page = PageState;

    async fn open_url(&self, url: &str) -> Result<PageState, AgentError> {
        let mut inner = self.inner.lock().unwrap();
        inner.current.url = url.to_string();
        Ok(inner.current.clone())
    }

    async fn current_page(&self) -> Result<PageState, AgentError> {
        Ok(self.inner.lock().unwrap().current.clone())
    }

    async fn execute(&self, action: &Action) -> Result<PageState, AgentError> {
        self.inner.lock().unwrap().executed.push(action.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.outcomes.pop_front() {
            Some(Ok(state)) => {
                inner.current = state.clone();
                Ok(state)
            }
            Some(Err(msg)) => Err(AgentError::Computer(msg)),
            None => Ok(inner.current.clone()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Seen {
    pub url: String,
    pub no_op_count: u32,
    pub stalled: bool,
    pub had_screenshot: bool,
}

struct ReasonerInner {
    proposals: VecDeque<Proposal>,
    seen: Vec<Seen>,
}

/// Hands out queued proposals and reports done once the queue is empty.
#[derive(Clone)]
pub struct ScriptedReasoner {
    inner: Arc<Mutex<ReasonerInner>>,
    delay: Option<Duration>,
}

impl ScriptedReasoner {
    pub fn new(proposals: Vec<Proposal>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReasonerInner { proposals: proposals.into(), seen: Vec::new() })),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.inner.lock().unwrap().seen.clone()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn propose(&self, obs: &Observation<'_>) -> Result<Proposal, AgentError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.seen.push(Seen {
            url: obs.snapshot.url.clone(),
            no_op_count: obs.no_op_count,
            stalled: obs.stalled,
            had_screenshot: obs.screenshot.is_some(),
        });
        Ok(inner
            .proposals
            .pop_front()
            .unwrap_or(Proposal::Done { summary: Some("finished".into()) }))
    }
}

pub fn act(action: Action) -> Proposal {
    Proposal::Act { action, rationale: None }
}

pub fn click(selector: &str) -> Proposal {
    act(Action::Click { target: flowcap::Locator::Css { selector: selector.to_string() } })
}

pub fn clicks(n: usize) -> Vec<Proposal> {
    (1..=n).map(|i| click(&format!("#b{i}"))).collect()
}
