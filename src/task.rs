use crate::agent::{Action, ActionKind};
use chrono::Utc;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

/// Web apps the capture tool knows how to scope a task to.
const KNOWN_APPS: &[(&str, &str, &str)] = &[
    ("linear", "Linear", "https://linear.app"),
    ("notion", "Notion", "https://notion.so"),
    ("asana", "Asana", "https://app.asana.com"),
    ("github", "GitHub", "https://github.com"),
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProfile {
    pub key: String,
    pub name: String,
    pub url: String,
}

impl AppProfile {
    pub fn new(key: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { key: key.into(), name: name.into(), url: url.into() }
    }

    /// Picks the first known app mentioned in the query.
    pub fn detect(query: &str) -> Self {
        let lower = query.to_lowercase();
        KNOWN_APPS
            .iter()
            .find(|(key, _, _)| lower.contains(key))
            .map(|(key, name, url)| Self::new(*key, *name, *url))
            .unwrap_or_else(Self::unknown)
    }

    pub fn unknown() -> Self {
        Self::new("unknown", "Unknown", "")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    /// Origin the task must stay within, e.g. `https://linear.app`. Empty means unrestricted.
    pub domain: String,
    pub allowed: BTreeSet<ActionKind>,
    pub stop_on_login: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    KindNotAllowed(ActionKind),
    LeavesDomain { url: String, domain: String },
    BadUrl(String),
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::KindNotAllowed(kind) => write!(f, "action kind {kind:?} is not allowed"),
            Violation::LeavesDomain { url, domain } => {
                write!(f, "navigation to {url} leaves {domain}")
            }
            Violation::BadUrl(url) => write!(f, "cannot navigate to {url}"),
        }
    }
}

impl ConstraintSet {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), allowed: ActionKind::all(), stop_on_login: true }
    }

    pub fn with_allowed(mut self, kinds: impl IntoIterator<Item = ActionKind>) -> Self {
        self.allowed = kinds.into_iter().collect();
        self
    }

    /// Checks an action before it is issued and returns the action to execute.
    /// Relative navigation targets are resolved against `current_url`.
    pub fn check(&self, action: &Action, current_url: &str) -> Result<Action, Violation> {
        let kind = action.kind();
        if !self.allowed.contains(&kind) {
            return Err(Violation::KindNotAllowed(kind));
        }
        match action {
            Action::Navigate { url } => Ok(Action::Navigate { url: self.check_url(url, current_url)?.into() }),
            other => Ok(other.clone()),
        }
    }

    fn check_url(&self, target: &str, current_url: &str) -> Result<Url, Violation> {
        let resolved = match Url::parse(target) {
            Ok(u) => u,
            Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(current_url)
                .and_then(|base| base.join(target))
                .map_err(|_| Violation::BadUrl(target.to_string()))?,
            Err(_) => return Err(Violation::BadUrl(target.to_string())),
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            return Err(Violation::BadUrl(target.to_string()));
        }
        if self.domain.is_empty() {
            return Ok(resolved);
        }
        let leaves = || Violation::LeavesDomain {
            url: resolved.to_string(),
            domain: self.domain.clone(),
        };
        let allowed_host = Url::parse(&self.domain)
            .ok()
            .and_then(|d| d.host_str().map(str::to_ascii_lowercase))
            .ok_or_else(leaves)?;
        let host = resolved.host_str().map(str::to_ascii_lowercase).ok_or_else(leaves)?;
        // Subdomains of the app's origin count as the same app.
        if host == allowed_host || host.ends_with(&format!(".{allowed_host}")) {
            Ok(resolved)
        } else {
            Err(leaves())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub query: String,
    pub instructions: String,
    pub app: AppProfile,
    pub constraints: ConstraintSet,
    pub start_url: Option<String>,
}

impl Task {
    /// Builds a task scoped to the app named in the query.
    pub fn from_query(query: &str) -> Self {
        let app = AppProfile::detect(query);
        let constraints = ConstraintSet::for_domain(app.url.clone());
        let start_url = (!app.url.is_empty()).then(|| app.url.clone());
        Self {
            id: task_id(&app.key, query),
            instructions: instructions_for(query, &app),
            query: query.to_string(),
            app,
            constraints,
            start_url,
        }
    }

    pub fn new(query: &str, app: AppProfile, constraints: ConstraintSet) -> Self {
        Self {
            id: task_id(&app.key, query),
            instructions: instructions_for(query, &app),
            query: query.to_string(),
            app,
            constraints,
            start_url: None,
        }
    }

    pub fn with_start_url(mut self, url: impl Into<String>) -> Self {
        self.start_url = Some(url.into());
        self
    }
}

fn task_id(app_key: &str, query: &str) -> String {
    let slug: String = query
        .chars()
        .take(40)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "{}_{}_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        app_key,
        slug.trim_matches('_'),
        nanoid!(6, &nanoid::alphabet::SAFE[2..])
    )
}

fn instructions_for(query: &str, app: &AppProfile) -> String {
    let name = if app.key == "unknown" { "the application" } else { app.name.as_str() };
    let mut s = format!("TASK: {query}\n\nINSTRUCTIONS:\n");
    if !app.url.is_empty() {
        s.push_str(&format!("1. Navigate to {} if not already there\n", app.url));
        s.push_str("2. Perform the requested action by interacting with the UI directly\n");
    } else {
        s.push_str("1. Perform the requested action by interacting with the UI directly\n");
    }
    s.push_str(&format!(
        "\nCONSTRAINTS:\n- ONLY interact with {name} UI\n- NEVER search the web or open documentation\n- NEVER navigate away from {name} domains\n- If you see a login page, stop and wait: the user will log in manually\n"
    ));
    s.push_str("\nCOMPLETION: Task is complete when the requested action has been performed.");
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Locator;

    #[test]
    fn detects_known_apps() {
        assert_eq!(AppProfile::detect("How do I create a project in Linear?").key, "linear");
        assert_eq!(AppProfile::detect("Delete the tracker in notion").url, "https://notion.so");
        assert_eq!(AppProfile::detect("book a flight").key, "unknown");
    }

    #[test]
    fn task_from_query_scopes_constraints() {
        let task = Task::from_query("How do I filter issues by status in Linear?");
        assert_eq!(task.constraints.domain, "https://linear.app");
        assert!(task.constraints.stop_on_login);
        assert_eq!(task.start_url.as_deref(), Some("https://linear.app"));
        assert!(task.id.contains("_linear_How_do_I_filter"));
        assert!(task.instructions.contains("NEVER navigate away from Linear domains"));
    }

    #[test]
    fn rejects_cross_domain_navigation() {
        let c = ConstraintSet::for_domain("https://linear.app");
        let here = "https://linear.app/team/issues";
        let off = Action::Navigate { url: "https://google.com/search?q=linear".into() };
        assert!(matches!(c.check(&off, here), Err(Violation::LeavesDomain { .. })));

        let sub = Action::Navigate { url: "https://docs.linear.app/x".into() };
        assert!(c.check(&sub, here).is_ok());
        let relative = Action::Navigate { url: "/settings".into() };
        assert_eq!(
            c.check(&relative, here),
            Ok(Action::Navigate { url: "https://linear.app/settings".into() })
        );
        let js = Action::Navigate { url: "javascript:alert(1)".into() };
        assert!(matches!(c.check(&js, here), Err(Violation::BadUrl(_))));
    }

    #[test]
    fn rejects_disallowed_kinds() {
        let c = ConstraintSet::for_domain("https://linear.app").with_allowed([ActionKind::Click]);
        let typing = Action::Type { text: "hi".into(), into: None };
        assert_eq!(
            c.check(&typing, "https://linear.app"),
            Err(Violation::KindNotAllowed(ActionKind::Type))
        );
        let click = Action::Click { target: Locator::Css { selector: "#new".into() } };
        assert!(c.check(&click, "https://linear.app").is_ok());
    }
}
