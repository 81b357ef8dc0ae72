//! Gateway error types.
//!
//! Defines error variants for profile resolution, command validation,
//! approval lifecycle failures, and remote transport failures. A non-zero
//! exit code from the remote host is not an error; it is reported inside
//! [`crate::runner::ExecutionResult`].

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    /// Connection, authentication, or timeout failure reaching the remote
    /// host. Distinct from a command that ran and exited non-zero.
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Stable machine-readable label, surfaced in tool responses.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UnknownProfile(_) => "unknown_profile",
            GatewayError::InvalidCommand(_) => "invalid_command",
            GatewayError::Config(_) => "config",
            GatewayError::Approval(err) => err.kind(),
            GatewayError::Transport(_) => "transport",
            GatewayError::Io(_) => "io",
        }
    }
}

/// Approval-specific errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// Approval id does not exist (never issued, or evicted after expiry).
    #[error("Unknown approval: {0}")]
    Unknown(String),

    /// Approval was already resolved by an earlier decision.
    #[error("Approval already consumed: {0}")]
    AlreadyConsumed(String),

    /// Approval outlived the pending TTL without a decision.
    #[error("Approval expired: {0}")]
    Expired(String),

    /// Decision value is neither `allow_once` nor `allow_prefix`.
    #[error("Invalid decision: {0} (use allow_once or allow_prefix)")]
    InvalidDecision(String),
}

impl ApprovalError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApprovalError::Unknown(_) => "unknown_approval",
            ApprovalError::AlreadyConsumed(_) => "already_consumed",
            ApprovalError::Expired(_) => "approval_expired",
            ApprovalError::InvalidDecision(_) => "invalid_decision",
        }
    }
}
