//! Command allowlist matching.
//!
//! Three layers decide whether a command is pre-authorized for a profile:
//! the profile's static rules (exact commands, token-boundary prefixes,
//! regex patterns), and the process-lifetime [`SessionAllowlist`] of
//! prefixes learned through `allow_prefix` approvals. Matching is
//! case-sensitive and deterministic: the same rule set and session state
//! always produce the same answer.

use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which rule class authorized a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationSource {
    StaticExact,
    StaticPrefix,
    StaticPattern,
    AllowAny,
    SessionPrefix,
    /// Not produced by matching; used by the audit log for runs that went
    /// through an explicit operator decision.
    UserDecision,
}

/// Token-boundary prefix rule: `prefix` authorizes `command` iff the command
/// equals the prefix or starts with the prefix followed by a space. This is
/// what keeps "git" from authorizing "github-cleanup".
pub fn prefix_match(prefix: &str, command: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    command == prefix
        || command
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(' '))
}

/// Suggested prefix for an approval prompt: the first token, plus the second
/// token when one exists and is not option-like. Advisory UI text only;
/// never consulted when deciding authorization.
pub fn suggest_prefix(command: &str) -> String {
    let tokens = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
    let mut iter = tokens.into_iter();
    let Some(program) = iter.next() else {
        return String::new();
    };
    match iter.next() {
        Some(sub) if !sub.starts_with('-') => format!("{program} {sub}"),
        _ => program,
    }
}

/// A profile's static allowlist, frozen at config load.
#[derive(Debug, Clone, Default)]
pub struct StaticAllowlist {
    /// Authorize every command for this profile.
    pub allow_any: bool,
    /// Exact-match command strings.
    pub exact: Vec<String>,
    /// Token-boundary prefixes.
    pub prefixes: Vec<String>,
    /// Compiled `allowed_regexes`.
    pub patterns: Vec<Regex>,
}

impl StaticAllowlist {
    /// Check the static rules in order and report which class matched.
    pub fn match_source(&self, command: &str) -> Option<AuthorizationSource> {
        if self.allow_any {
            return Some(AuthorizationSource::AllowAny);
        }
        if self.exact.iter().any(|rule| rule == command) {
            return Some(AuthorizationSource::StaticExact);
        }
        if self.prefixes.iter().any(|p| prefix_match(p, command)) {
            return Some(AuthorizationSource::StaticPrefix);
        }
        if self.patterns.iter().any(|re| re.is_match(command)) {
            return Some(AuthorizationSource::StaticPattern);
        }
        None
    }

    pub fn permits(&self, command: &str) -> bool {
        self.match_source(command).is_some()
    }
}

/// Process-lifetime store of prefixes learned through `allow_prefix`
/// approvals, keyed by profile name. Created empty at startup, grows only
/// through accepted decisions, and is never persisted.
#[derive(Debug, Default)]
pub struct SessionAllowlist {
    prefixes: DashMap<String, HashSet<String>>,
}

impl SessionAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a learned prefix for a profile. Idempotent: re-adding an existing
    /// pair is a no-op. Returns whether the entry was new.
    pub fn add_prefix(&self, profile: &str, prefix: impl Into<String>) -> bool {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return false;
        }
        let inserted = self
            .prefixes
            .entry(profile.to_string())
            .or_default()
            .insert(prefix.clone());
        if inserted {
            debug!(profile, prefix, "session prefix learned");
        }
        inserted
    }

    /// Whether any learned prefix for this profile authorizes the command.
    pub fn matches(&self, profile: &str, command: &str) -> bool {
        self.prefixes
            .get(profile)
            .is_some_and(|set| set.iter().any(|p| prefix_match(p, command)))
    }

    /// Learned prefixes for a profile, sorted for stable output.
    pub fn prefixes_for(&self, profile: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .prefixes
            .get(profile)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Clear the entries for one profile, or every profile when `None`.
    /// Returns the number of prefixes removed.
    pub fn clear(&self, profile: Option<&str>) -> usize {
        match profile {
            Some(name) => self
                .prefixes
                .remove(name)
                .map(|(_, set)| set.len())
                .unwrap_or(0),
            None => {
                let removed = self.prefixes.iter().map(|e| e.value().len()).sum();
                self.prefixes.clear();
                removed
            }
        }
    }

    pub fn len(&self) -> usize {
        self.prefixes.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Combines a profile's static rules with the session-learned prefixes.
/// Authorization order: static exact, static prefix, static pattern, then
/// session prefixes. Read-only; no side effects.
#[derive(Debug, Clone)]
pub struct AllowlistMatcher {
    session: Arc<SessionAllowlist>,
}

impl AllowlistMatcher {
    pub fn new(session: Arc<SessionAllowlist>) -> Self {
        Self { session }
    }

    /// Which rule class, if any, authorizes `command` for this profile.
    pub fn authorization(
        &self,
        profile: &str,
        rules: &StaticAllowlist,
        command: &str,
    ) -> Option<AuthorizationSource> {
        rules.match_source(command).or_else(|| {
            self.session
                .matches(profile, command)
                .then_some(AuthorizationSource::SessionPrefix)
        })
    }

    pub fn is_authorized(&self, profile: &str, rules: &StaticAllowlist, command: &str) -> bool {
        self.authorization(profile, rules, command).is_some()
    }
}
