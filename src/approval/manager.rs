//! Pending-approval lifecycle.
//!
//! A pending approval is created when a command fails every allowlist check
//! and is consumed by exactly one decision. Ids are v4 uuids, so they are
//! unguessable and never deduplicated: asking twice for the same command
//! mints two independent approvals. Consumed records are kept until TTL
//! eviction so a replayed id is reported as `AlreadyConsumed` rather than
//! `Unknown`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::audit::{AuditLog, DecisionResult};
use crate::{allowlist::AuthorizationSource, error::ApprovalError};

/// Default lifetime of an undecided approval (5 minutes).
const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(300);

pub const CHOICE_ALLOW_ONCE: &str = "allow_once";
pub const CHOICE_ALLOW_PREFIX: &str = "allow_prefix";

/// A command awaiting an operator decision.
#[derive(Debug)]
pub struct PendingApproval {
    pub id: String,
    pub profile: String,
    pub command: String,
    pub suggested_prefix: String,
    pub created_at: Instant,
    consumed: bool,
}

/// Operator decision against a pending approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Run the original command; learn nothing.
    AllowOnce,
    /// Run the original command and persist a prefix for the session.
    /// `None` means accept the suggested prefix.
    AllowPrefix { prefix: Option<String> },
}

impl ApprovalDecision {
    /// Parse the wire form: a choice label plus an optional prefix override.
    pub fn from_wire(decision: &str, prefix: Option<String>) -> Result<Self, ApprovalError> {
        match decision {
            CHOICE_ALLOW_ONCE => Ok(ApprovalDecision::AllowOnce),
            CHOICE_ALLOW_PREFIX => Ok(ApprovalDecision::AllowPrefix { prefix }),
            other => Err(ApprovalError::InvalidDecision(other.to_string())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ApprovalDecision::AllowOnce => CHOICE_ALLOW_ONCE,
            ApprovalDecision::AllowPrefix { .. } => CHOICE_ALLOW_PREFIX,
        }
    }
}

/// Response returned to the caller when a command needs approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub choices: Vec<String>,
    pub suggested_prefix: String,
    pub message: String,
}

/// What a consumed approval authorizes: the original command on the original
/// profile, plus the prefix to persist for `allow_prefix`.
#[derive(Debug, Clone)]
pub struct ApprovalGrant {
    pub profile: String,
    pub command: String,
    pub decision: &'static str,
    pub persist_prefix: Option<String>,
}

/// Creates, validates, and consumes pending approvals. Single-use semantics
/// are enforced through the map's entry guard: check-and-consume is atomic
/// with respect to concurrent resolvers.
pub struct ApprovalManager {
    pending: DashMap<String, PendingApproval>,
    ttl: Duration,
    audit: Arc<AuditLog>,
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new(Arc::new(AuditLog::new()))
    }
}

impl ApprovalManager {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            pending: DashMap::new(),
            ttl: DEFAULT_PENDING_TTL,
            audit,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Record a pending approval and return the response for the caller.
    /// Every call mints a fresh id; identical commands are not deduplicated.
    pub fn create_pending(
        &self,
        profile: &str,
        command: &str,
        suggested_prefix: &str,
    ) -> ApprovalRequest {
        self.evict_expired();

        let id = uuid::Uuid::new_v4().to_string();
        self.pending.insert(
            id.clone(),
            PendingApproval {
                id: id.clone(),
                profile: profile.to_string(),
                command: command.to_string(),
                suggested_prefix: suggested_prefix.to_string(),
                created_at: Instant::now(),
                consumed: false,
            },
        );
        self.audit.record_decision(
            profile,
            command,
            DecisionResult::Pending,
            AuthorizationSource::UserDecision,
        );
        debug!(profile, command, approval_id = %id, "approval pending");

        ApprovalRequest {
            approval_id: id,
            choices: vec![CHOICE_ALLOW_ONCE.to_string(), CHOICE_ALLOW_PREFIX.to_string()],
            suggested_prefix: suggested_prefix.to_string(),
            message: "Command not in allowlist. Ask the operator to approve once or allow \
                      the prefix for this session."
                .to_string(),
        }
    }

    /// Consume a pending approval. Fails with `Unknown` for an id that was
    /// never issued or was evicted, `AlreadyConsumed` for a replayed
    /// decision, and `Expired` for an approval that outlived the TTL.
    pub fn resolve(
        &self,
        approval_id: &str,
        decision: &ApprovalDecision,
    ) -> Result<ApprovalGrant, ApprovalError> {
        let mut entry = self
            .pending
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::Unknown(approval_id.to_string()))?;

        if entry.consumed {
            let err = ApprovalError::AlreadyConsumed(approval_id.to_string());
            self.record_denied(&entry, &err);
            return Err(err);
        }
        if entry.created_at.elapsed() > self.ttl {
            let err = ApprovalError::Expired(approval_id.to_string());
            self.record_denied(&entry, &err);
            drop(entry);
            self.pending.remove(approval_id);
            return Err(err);
        }

        entry.consumed = true;
        let persist_prefix = match decision {
            ApprovalDecision::AllowOnce => None,
            ApprovalDecision::AllowPrefix { prefix } => Some(
                prefix
                    .clone()
                    .unwrap_or_else(|| entry.suggested_prefix.clone()),
            ),
        };

        self.audit.record_decision(
            &entry.profile,
            &entry.command,
            DecisionResult::Approved,
            AuthorizationSource::UserDecision,
        );

        Ok(ApprovalGrant {
            profile: entry.profile.clone(),
            command: entry.command.clone(),
            decision: decision.label(),
            persist_prefix,
        })
    }

    fn record_denied(&self, entry: &PendingApproval, err: &ApprovalError) {
        self.audit.record_decision(
            &entry.profile,
            &entry.command,
            DecisionResult::Denied {
                reason: err.to_string(),
            },
            AuthorizationSource::UserDecision,
        );
    }

    /// Drop records older than the TTL, consumed or not.
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.pending.retain(|_, p| p.created_at.elapsed() <= ttl);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}
