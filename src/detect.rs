use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

const LOGIN_URL_PATTERNS: &[&str] = &[
    "login", "signin", "sign-in", "sign_in", "auth", "authenticate", "oauth", "signup",
];

const LOGIN_TITLE_KEYWORDS: &[&str] = &[
    "password", "email", "username", "sign in", "log in", "forgot password",
    "create account", "register", "signup",
];

/// One login heuristic. Rules are evaluated in list order and the first one
/// that fires decides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "pattern", rename_all = "snake_case")]
pub enum LoginRule {
    /// Substring of the lowercased url path and query.
    UrlPath(String),
    /// The page shows a password or one-time-code field.
    CredentialInput,
    /// Substring of the lowercased page title.
    TitleKeyword(String),
}

impl LoginRule {
    pub fn fires(&self, candidate: &Snapshot) -> bool {
        match self {
            LoginRule::UrlPath(pattern) => url_tail(&candidate.url).contains(pattern.as_str()),
            LoginRule::CredentialInput => candidate.credential_input,
            LoginRule::TitleKeyword(keyword) => {
                candidate.title.to_lowercase().contains(keyword.as_str())
            }
        }
    }
}

impl fmt::Display for LoginRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginRule::UrlPath(p) => write!(f, "url path matches '{p}'"),
            LoginRule::CredentialInput => f.write_str("credential input present"),
            LoginRule::TitleKeyword(k) => write!(f, "title contains '{k}'"),
        }
    }
}

// Hosts such as `auth0.com` or `oauth.example` are not evidence of a sign-in page,
// so only the part after the host is matched.
fn url_tail(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(u) => {
            let mut tail = u.path().to_lowercase();
            if let Some(q) = u.query() {
                tail.push('?');
                tail.push_str(&q.to_lowercase());
            }
            tail
        }
        Err(_) => raw.to_lowercase(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    Unchanged,
    Changed,
    LoginRequired { rule: LoginRule },
}

#[derive(Clone, Debug)]
pub struct ChangeDetector {
    rules: Vec<LoginRule>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        let mut rules: Vec<LoginRule> = LOGIN_URL_PATTERNS
            .iter()
            .map(|p| LoginRule::UrlPath((*p).to_string()))
            .collect();
        rules.push(LoginRule::CredentialInput);
        rules.extend(LOGIN_TITLE_KEYWORDS.iter().map(|k| LoginRule::TitleKeyword((*k).to_string())));
        Self { rules }
    }
}

impl ChangeDetector {
    pub fn with_rules(rules: Vec<LoginRule>) -> Self {
        Self { rules }
    }

    /// Appends a rule after every existing one.
    pub fn push_rule(&mut self, rule: LoginRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[LoginRule] {
        &self.rules
    }

    /// First login rule that fires for the candidate, if any.
    pub fn login_rule(&self, candidate: &Snapshot) -> Option<&LoginRule> {
        self.rules.iter().find(|r| r.fires(candidate))
    }

    pub fn classify(&self, previous: Option<&Snapshot>, candidate: &Snapshot) -> Classification {
        let Some(previous) = previous else {
            return Classification::Changed;
        };
        if let Some(rule) = self.login_rule(candidate) {
            return Classification::LoginRequired { rule: rule.clone() };
        }
        if previous.fingerprint == candidate.fingerprint {
            Classification::Unchanged
        } else {
            Classification::Changed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(url: &str, title: &str, body: &str) -> Snapshot {
        Snapshot::observed(url, title, body)
    }

    #[test]
    fn first_state_is_always_changed() {
        let d = ChangeDetector::default();
        let first = snap("https://app.test/dashboard", "Dashboard", "h1");
        assert_eq!(d.classify(None, &first), Classification::Changed);
    }

    #[test]
    fn identical_content_is_unchanged() {
        let d = ChangeDetector::default();
        let a = snap("https://app.test/dashboard", "Dashboard", "h1");
        let b = snap("https://app.test/dashboard", "Dashboard", "h1");
        assert_eq!(d.classify(Some(&a), &b), Classification::Unchanged);
        let c = snap("https://app.test/dashboard", "Dashboard", "h2");
        assert_eq!(d.classify(Some(&a), &c), Classification::Changed);
    }

    #[test]
    fn login_wins_over_fingerprint_equality() {
        let d = ChangeDetector::default();
        let prev = snap("https://app.test/login", "Sign in", "same");
        let cand = snap("https://app.test/login", "Sign in", "same");
        assert_eq!(
            d.classify(Some(&prev), &cand),
            Classification::LoginRequired { rule: LoginRule::UrlPath("login".into()) }
        );
    }

    #[test]
    fn rules_fire_in_declared_order() {
        let d = ChangeDetector::default();
        let prev = snap("https://app.test/home", "Home", "x");

        let by_title = snap("https://app.test/welcome", "Sign in to Acme", "y");
        assert_eq!(
            d.classify(Some(&prev), &by_title),
            Classification::LoginRequired { rule: LoginRule::TitleKeyword("sign in".into()) }
        );

        let by_field = snap("https://app.test/welcome", "Acme", "y").with_credential_input(true);
        assert_eq!(
            d.classify(Some(&prev), &by_field),
            Classification::LoginRequired { rule: LoginRule::CredentialInput }
        );
    }

    #[test]
    fn host_names_do_not_trigger_url_rules() {
        let d = ChangeDetector::default();
        let prev = snap("https://app.test/home", "Home", "x");
        let cand = snap("https://auth0.example.com/dashboard", "Dashboard", "y");
        assert_eq!(d.classify(Some(&prev), &cand), Classification::Changed);
    }

    #[test]
    fn custom_rules_append_after_defaults() {
        let mut d = ChangeDetector::with_rules(vec![LoginRule::UrlPath("sso".into())]);
        d.push_rule(LoginRule::TitleKeyword("two-factor".into()));
        let prev = snap("https://app.test/home", "Home", "x");
        let cand = snap("https://app.test/home", "Two-Factor check", "y");
        assert_eq!(
            d.classify(Some(&prev), &cand),
            Classification::LoginRequired { rule: LoginRule::TitleKeyword("two-factor".into()) }
        );
        assert_eq!(d.rules().len(), 2);
    }
}
