//! Normalized observations of the live page.
//!
//! A [`Snapshot`] is what the rest of the loop reasons about: where the page is,
//! what it is called, and a content fingerprint that identifies the rendered
//! state. The raw screenshot never lives inside the snapshot; it is written to a
//! [`CaptureStore`] and only the returned reference is kept.

use crate::agent::{AgentError, PageHandle};
use crate::store::CaptureStore;
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// SHA-256 over the url (fragment stripped), title and normalized excerpt.
    pub fn of(url: &str, title: &str, excerpt: &str) -> Self {
        let url = url.split('#').next().unwrap_or(url);
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(title.trim().as_bytes());
        hasher.update(b"\n");
        hasher.update(excerpt.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub url: String,
    pub title: String,
    pub fingerprint: Fingerprint,
    /// Monotonic offset from the start of the task.
    pub elapsed_ms: u64,
    pub captured_at: DateTime<Utc>,
    /// Reference to the raw screenshot in the capture store.
    pub capture: Option<String>,
    #[serde(skip)]
    pub excerpt: String,
    #[serde(skip)]
    pub credential_input: bool,
}

impl Snapshot {
    /// Builds a snapshot from already-read page signals, without a stored capture.
    pub fn observed(url: &str, title: &str, text: &str) -> Self {
        let excerpt = normalize_excerpt(text, usize::MAX);
        Self {
            id: nanoid!(),
            fingerprint: Fingerprint::of(url, title, &excerpt),
            url: url.to_string(),
            title: title.to_string(),
            elapsed_ms: 0,
            captured_at: Utc::now(),
            capture: None,
            excerpt,
            credential_input: false,
        }
    }

    pub fn with_credential_input(mut self, present: bool) -> Self {
        self.credential_input = present;
        self
    }
}

/// Collapses whitespace runs and caps the excerpt at `limit` characters.
pub fn normalize_excerpt(text: &str, limit: usize) -> String {
    let mut out = String::new();
    for (i, word) in text.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(word);
    }
    match out.char_indices().nth(limit) {
        Some((cut, _)) => out[..cut].to_string(),
        None => out,
    }
}

/// A snapshot plus the raw screenshot bytes it references.
pub struct Captured {
    pub snapshot: Snapshot,
    pub png: Vec<u8>,
}

pub struct SnapshotBuilder {
    store: Arc<dyn CaptureStore>,
    task_id: String,
    started: Instant,
    excerpt_limit: usize,
    seq: u32,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn CaptureStore>, task_id: impl Into<String>, excerpt_limit: usize) -> Self {
        Self {
            store,
            task_id: task_id.into(),
            started: Instant::now(),
            excerpt_limit,
            seq: 0,
        }
    }

    /// Reads the settled page and persists its screenshot.
    ///
    /// Any failure to read the page or store the image is reported as
    /// [`AgentError::CaptureUnavailable`]; nothing is retried here.
    pub async fn capture(&mut self, page: &dyn PageHandle) -> Result<Captured, AgentError> {
        let unavailable = |e: AgentError| AgentError::CaptureUnavailable(e.to_string());
        let url = page.url().await.map_err(unavailable)?;
        let title = page.title().await.map_err(unavailable)?;
        let text = page.text_excerpt().await.map_err(unavailable)?;
        let credential_input = page.has_credential_input().await.map_err(unavailable)?;
        let png = page.screenshot_png().await.map_err(unavailable)?;

        self.seq += 1;
        let reference = self
            .store
            .store_capture(&self.task_id, self.seq, &png)
            .await
            .map_err(unavailable)?;

        let excerpt = normalize_excerpt(&text, self.excerpt_limit);
        let snapshot = Snapshot {
            id: nanoid!(),
            fingerprint: Fingerprint::of(&url, &title, &excerpt),
            url,
            title,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            captured_at: Utc::now(),
            capture: Some(reference),
            excerpt,
            credential_input,
        };
        debug!(seq = self.seq, url = %snapshot.url, fingerprint = %snapshot.fingerprint, "captured");
        Ok(Captured { snapshot, png })
    }

    /// Drops the raw capture of a snapshot that was not accepted.
    pub async fn discard(&self, snapshot: &Snapshot) {
        if let Some(reference) = &snapshot.capture {
            if let Err(e) = self.store.discard(reference).await {
                debug!(%reference, error = %e, "discard failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Fingerprint::of("https://x.app/a", "A", "hello world");
        let b = Fingerprint::of("https://x.app/a", "A", "hello world");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 64);
    }

    #[test]
    fn fingerprint_ignores_fragment_but_not_content() {
        let base = Fingerprint::of("https://x.app/a", "A", "hello");
        assert_eq!(base, Fingerprint::of("https://x.app/a#top", "A", "hello"));
        assert_ne!(base, Fingerprint::of("https://x.app/a", "A", "hello!"));
        assert_ne!(base, Fingerprint::of("https://x.app/b", "A", "hello"));
        assert_ne!(base, Fingerprint::of("https://x.app/a", "B", "hello"));
    }

    #[test]
    fn excerpt_collapses_whitespace_and_truncates() {
        assert_eq!(normalize_excerpt("  a \n\t b   c ", 100), "a b c");
        assert_eq!(normalize_excerpt("héllo wörld", 4), "héll");
        assert_eq!(
            Snapshot::observed("u", "t", "a   b").fingerprint,
            Snapshot::observed("u", "t", "a\nb").fingerprint
        );
    }
}
