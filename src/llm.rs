use crate::agent::{Action, AgentError, Observation, Proposal, Reasoner};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;

const SYSTEM_PROMPT: &str = r#"You operate a web browser to complete a task inside one web application.
Reply with exactly one JSON object and nothing else, in one of these shapes:
{"action": <action>, "rationale": "<why>"}
{"done": true, "summary": "<what was achieved>"}
<action> is one of:
{"type": "click", "target": <locator>}
{"type": "hover", "target": <locator>}
{"type": "type", "text": "...", "into": <locator or null>}
{"type": "key", "combo": "Enter"}
{"type": "scroll", "dx": 0, "dy": 600}
{"type": "navigate", "url": "..."}
{"type": "wait", "ms": 1000}
<locator> is one of:
{"by": "css", "selector": "..."}, {"by": "x_path", "expr": "..."},
{"by": "text", "pattern": "..."}, {"by": "coordinates", "x": 0, "y": 0}
Never leave the application's domain. If the page asks you to sign in, wait: a human will log in."#;

#[derive(Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    /// Send the latest screenshot along with the page text.
    pub attach_screenshot: bool,
    pub excerpt_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("FLOWCAP_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            temperature: 0.0,
            attach_screenshot: true,
            excerpt_chars: 3000,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmConfig,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    /// Sends a chat completion request and returns the first choice's text.
    pub async fn complete(&self, messages: Value) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let req = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "response_format": { "type": "json_object" },
            "messages": messages,
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("LLM error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse LLM response JSON")?;
        Self::parse_output(v)
    }

    fn parse_output(v: Value) -> Result<String> {
        v.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .context("response has no message content")
    }
}

#[derive(Deserialize)]
struct RawReply {
    #[serde(default)]
    done: bool,
    summary: Option<String>,
    action: Option<Action>,
    rationale: Option<String>,
}

/// Decodes the model's JSON reply, tolerating a surrounding markdown fence.
pub fn decode_proposal(text: &str) -> Result<Proposal> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let raw: RawReply = serde_json::from_str(body).with_context(|| format!("unparseable reply: {body}"))?;
    if raw.done {
        return Ok(Proposal::Done { summary: raw.summary });
    }
    match raw.action {
        Some(action) => Ok(Proposal::Act { action, rationale: raw.rationale }),
        None => bail!("reply has neither an action nor done: {body}"),
    }
}

pub struct LlmReasoner {
    client: LlmClient,
}

impl LlmReasoner {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    fn compose(&self, obs: &Observation<'_>) -> Value {
        let snap = obs.snapshot;
        let excerpt: String = snap.excerpt.chars().take(self.client.config().excerpt_chars).collect();
        let mut text = format!(
            "{}\n\nCurrent page\nurl: {}\ntitle: {}\ntext: {}\n",
            obs.task.instructions, snap.url, snap.title, excerpt
        );
        if !obs.constraints.domain.is_empty() {
            text.push_str(&format!("\nStay within {}.\n", obs.constraints.domain));
        }
        if obs.no_op_count > 0 {
            text.push_str(&format!(
                "\nYour last {} action(s) changed nothing on the page.",
                obs.no_op_count
            ));
            if obs.stalled {
                text.push_str(" Stop repeating them: try a different element or approach, or reply done if the task is complete.");
            }
            text.push('\n');
        }

        let mut content = vec![json!({ "type": "text", "text": text })];
        if let (true, Some(png)) = (self.client.config().attach_screenshot, obs.screenshot) {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{}", STANDARD.encode(png)) }
            }));
        }
        json!([
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": content },
        ])
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    async fn propose(&self, observation: &Observation<'_>) -> Result<Proposal, AgentError> {
        let messages = self.compose(observation);
        let reply = self
            .client
            .complete(messages)
            .await
            .map_err(|e| AgentError::Reasoner(e.to_string()))?;
        decode_proposal(&reply).map_err(|e| AgentError::Reasoner(e.to_string()))
    }
}
