//! Audit log of authorization decisions.
//!
//! Bounded in-memory record of how every command execution was decided:
//! which allowlist rule authorized it, which approvals were created, and how
//! each approval was resolved. Oldest entries are evicted at capacity.

use std::{
    collections::VecDeque,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::allowlist::AuthorizationSource;

const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Terminal or intermediate outcome of a decision point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionResult {
    /// Authorized by the allowlist without operator involvement.
    Authorized,
    /// Escalated to a pending approval.
    Pending,
    /// Approved by an operator decision.
    Approved,
    Denied { reason: String },
}

impl DecisionResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DecisionResult::Pending)
    }
}

/// A single audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub profile: String,
    pub command: String,
    pub result: DecisionResult,
    pub source: AuthorizationSource,
}

impl AuditEntry {
    pub fn new(
        profile: String,
        command: String,
        result: DecisionResult,
        source: AuthorizationSource,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            profile,
            command,
            result,
            source,
        }
    }
}

/// Thread-safe bounded audit log.
#[derive(Debug)]
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries,
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().unwrap();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn record_decision(
        &self,
        profile: &str,
        command: &str,
        result: DecisionResult,
        source: AuthorizationSource,
    ) {
        self.record(AuditEntry::new(
            profile.to_string(),
            command.to_string(),
            result,
            source,
        ));
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn for_profile(&self, profile: &str, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .rev()
            .filter(|e| e.profile == profile)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}
