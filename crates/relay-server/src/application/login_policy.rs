//! Pluggable accept/refuse decision for login attempts.
//!
//! The broker consults a [`LoginPolicy`] after its own checks (the endpoint is
//! not logged in yet, the email is not empty and not already in use) have
//! passed.  The policy may take as long as it likes; the endpoint's inbound
//! processing waits for the decision, other endpoints are unaffected.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

/// Outcome of a login decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginDecision {
    Accept,
    Refuse { reason: String },
}

impl LoginDecision {
    pub fn refuse(reason: impl Into<String>) -> Self {
        LoginDecision::Refuse {
            reason: reason.into(),
        }
    }
}

/// Collaborator deciding whether a proposed login identity is accepted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoginPolicy: Send + Sync {
    async fn decide(&self, email: &str) -> LoginDecision;
}

/// Accepts everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl LoginPolicy for AllowAll {
    async fn decide(&self, _email: &str) -> LoginDecision {
        LoginDecision::Accept
    }
}

/// Accepts only emails on a fixed list (compared case-insensitively).
#[derive(Debug, Clone)]
pub struct AllowList {
    allowed: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: emails
                .into_iter()
                .map(|e| e.as_ref().trim().to_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl LoginPolicy for AllowList {
    async fn decide(&self, email: &str) -> LoginDecision {
        if self.allowed.contains(&email.trim().to_lowercase()) {
            LoginDecision::Accept
        } else {
            LoginDecision::refuse("not on the allow list")
        }
    }
}

/// Builds the policy described by the `[access]` config section: an empty
/// list means everyone may log in.
pub fn policy_for(allowed_emails: &[String]) -> Arc<dyn LoginPolicy> {
    if allowed_emails.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(AllowList::new(allowed_emails))
    }
}
