//! Subject grammar and the vault naming contract.
//!
//! Subjects are dot-separated tokens. Subscriptions may use `*` to match exactly one
//! token and a trailing `>` to match one or more remaining tokens. Wildcards are a
//! subscribe-only construct: a publish to a wildcard subject is never delivered, so
//! [`Subject::ensure_publishable`] rejects it before a frame is built.
//!
//! The vault contract:
//!
//! ```text
//! {scope}.forVault.{operation}              app -> vault requests
//! {scope}.forApp.{operation}.{requestId}    vault -> app replies
//! {scope}.forApp.{notificationType}         vault -> app pushes
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Segment for app -> vault traffic.
pub const FOR_VAULT: &str = "forVault";
/// Segment for vault -> app traffic.
pub const FOR_APP: &str = "forApp";

const SINGLE_WILDCARD: &str = "*";
const SUFFIX_WILDCARD: &str = ">";

/// Subject validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("subject is empty")]
    Empty,

    #[error("subject {0:?} contains an empty token")]
    EmptyToken(String),

    #[error("subject {0:?} contains whitespace or control characters")]
    InvalidCharacter(String),

    #[error("subject {0:?}: '>' is only allowed as the last token")]
    MisplacedSuffixWildcard(String),

    #[error("subject {0:?}: wildcards must be whole tokens")]
    PartialWildcard(String),

    #[error("cannot publish to wildcard subject {0:?}")]
    WildcardNotPublishable(String),

    #[error("{0:?} is not a valid subject fragment")]
    InvalidFragment(String),
}

/// A validated subject or subscription pattern.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject(String);

impl Subject {
    /// Parse a subject or pattern. Wildcards are accepted.
    pub fn parse(raw: impl Into<String>) -> Result<Self, SubjectError> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    /// Parse a subject that will be published to. Wildcards are rejected.
    pub fn publishable(raw: impl Into<String>) -> Result<Self, SubjectError> {
        let subject = Self::parse(raw)?;
        subject.ensure_publishable()?;
        Ok(subject)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn has_wildcard(&self) -> bool {
        self.tokens()
            .any(|t| t == SINGLE_WILDCARD || t == SUFFIX_WILDCARD)
    }

    pub fn ensure_publishable(&self) -> Result<(), SubjectError> {
        if self.has_wildcard() {
            return Err(SubjectError::WildcardNotPublishable(self.0.clone()));
        }
        Ok(())
    }

    /// Whether this pattern matches the literal `subject`.
    pub fn matches(&self, subject: &str) -> bool {
        let mut literal = subject.split('.');
        for pattern_token in self.tokens() {
            if pattern_token == SUFFIX_WILDCARD {
                return literal.next().is_some_and(|t| !t.is_empty());
            }
            match literal.next() {
                Some(token) if pattern_token == SINGLE_WILDCARD && !token.is_empty() => {}
                Some(token) if token == pattern_token => {}
                _ => return false,
            }
        }
        literal.next().is_none()
    }
}

fn validate(raw: &str) -> Result<(), SubjectError> {
    if raw.is_empty() {
        return Err(SubjectError::Empty);
    }
    if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SubjectError::InvalidCharacter(raw.to_string()));
    }

    let tokens: Vec<&str> = raw.split('.').collect();
    let last = tokens.len() - 1;
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(SubjectError::EmptyToken(raw.to_string()));
        }
        if *token == SUFFIX_WILDCARD && idx != last {
            return Err(SubjectError::MisplacedSuffixWildcard(raw.to_string()));
        }
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(SubjectError::PartialWildcard(raw.to_string()));
        }
    }
    Ok(())
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subject({})", self.0)
    }
}

impl FromStr for Subject {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}

/// Builds subjects for one client scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSubjects {
    scope: String,
}

impl VaultSubjects {
    /// `scope` is the client's subject prefix, e.g. `OwnerSpace.4f2a`.
    pub fn new(scope: impl Into<String>) -> Result<Self, SubjectError> {
        let scope = scope.into();
        Subject::publishable(scope.as_str())?;
        Ok(Self { scope })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// `{scope}.forVault.{operation}`
    pub fn for_vault(&self, operation: &str) -> Result<Subject, SubjectError> {
        fragment(operation)?;
        Subject::publishable(format!("{}.{FOR_VAULT}.{operation}", self.scope))
    }

    /// `{scope}.forApp.{operation}.{request_id}`
    pub fn reply(&self, operation: &str, request_id: &str) -> Result<Subject, SubjectError> {
        fragment(operation)?;
        fragment(request_id)?;
        Subject::publishable(format!(
            "{}.{FOR_APP}.{operation}.{request_id}",
            self.scope
        ))
    }

    /// `{scope}.forApp.{notification_type}`
    pub fn notification(&self, notification_type: &str) -> Result<Subject, SubjectError> {
        fragment(notification_type)?;
        Subject::publishable(format!("{}.{FOR_APP}.{notification_type}", self.scope))
    }

    /// Whether a literal subject lives in this client's `forApp` namespace.
    pub fn is_inbound(&self, subject: &str) -> bool {
        subject
            .strip_prefix(self.scope.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.strip_prefix(FOR_APP))
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

fn fragment(raw: &str) -> Result<(), SubjectError> {
    match Subject::publishable(raw) {
        Ok(_) => Ok(()),
        Err(_) => Err(SubjectError::InvalidFragment(raw.to_string())),
    }
}
