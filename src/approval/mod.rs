//! Pending-approval lifecycle and decision auditing.

pub mod audit;
pub mod manager;

pub use audit::{AuditEntry, AuditLog, DecisionResult};
pub use manager::{
    ApprovalDecision, ApprovalGrant, ApprovalManager, ApprovalRequest, CHOICE_ALLOW_ONCE,
    CHOICE_ALLOW_PREFIX,
};
