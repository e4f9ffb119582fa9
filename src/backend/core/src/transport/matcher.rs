//! Subject patterns.
//!
//! Subjects are `.`-separated tokens. In patterns `*` matches exactly one token
//! and `>` (only as the last token) matches one or more remaining tokens.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TributaryError};

/// Token separator inside a subject.
pub const SUBJECT_SEPARATOR: char = '.';

/// Matches exactly one token.
pub const SINGLE_WILDCARD: &str = "*";

/// Matches one or more trailing tokens.
pub const TAIL_WILDCARD: &str = ">";

/// Selects subjects for listing and subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SubjectMatcher {
    /// Every subject
    All,
    /// One subject
    Exact(String),
    /// Subjects starting with a literal prefix
    Prefix(String),
    /// Wildcard pattern (`*`, `>`)
    Pattern(String),
}

impl SubjectMatcher {
    /// Create a wildcard pattern matcher, rejecting malformed patterns.
    pub fn pattern(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        validate_pattern(&pattern)?;
        Ok(Self::Pattern(pattern))
    }

    /// Check whether a subject is selected.
    pub fn matches(&self, subject: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(s) => s == subject,
            Self::Prefix(p) => subject.starts_with(p.as_str()),
            Self::Pattern(p) => pattern_matches(p, subject),
        }
    }

    /// A Redis `MATCH` glob that selects a superset of this matcher's subjects.
    ///
    /// Callers still filter with [`SubjectMatcher::matches`].
    pub fn to_glob(&self) -> String {
        match self {
            Self::All => "*".to_string(),
            Self::Exact(s) => escape_glob(s),
            Self::Prefix(p) => format!("{}*", escape_glob(p)),
            Self::Pattern(p) => {
                let tokens: Vec<String> = p
                    .split(SUBJECT_SEPARATOR)
                    .map(|t| match t {
                        SINGLE_WILDCARD | TAIL_WILDCARD => "*".to_string(),
                        literal => escape_glob(literal),
                    })
                    .collect();
                tokens.join(".")
            }
        }
    }
}

/// Validate a wildcard pattern.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(TributaryError::transport("subject pattern is empty"));
    }
    let tokens: Vec<&str> = pattern.split(SUBJECT_SEPARATOR).collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(TributaryError::transport(format!(
                "subject pattern '{}' contains an empty token",
                pattern
            )));
        }
        if *token == TAIL_WILDCARD && i != tokens.len() - 1 {
            return Err(TributaryError::transport(format!(
                "'>' must be the last token in subject pattern '{}'",
                pattern
            )));
        }
    }
    Ok(())
}

fn pattern_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split(SUBJECT_SEPARATOR);

    for p in pattern.split(SUBJECT_SEPARATOR) {
        if p == TAIL_WILDCARD {
            return subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == SINGLE_WILDCARD || p == s => continue,
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
