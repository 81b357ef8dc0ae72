//! Allowlist-gated remote command execution over MCP.
//!
//! ## Modules
//!
//! - [`config`]: profile configuration and the read-only store
//! - [`allowlist`]: static rules, session-learned prefixes, matching
//! - [`approval`]: pending-approval lifecycle and decision auditing
//! - [`runner`]: remote execution behind the [`runner::CommandRunner`] seam
//! - [`orchestrator`]: the four exposed operations
//! - [`server`]: the MCP stdio tool surface

pub mod allowlist;
pub mod approval;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod runner;
pub mod server;

pub use allowlist::{
    prefix_match, suggest_prefix, AllowlistMatcher, AuthorizationSource, SessionAllowlist,
    StaticAllowlist,
};
pub use approval::{
    ApprovalDecision, ApprovalGrant, ApprovalManager, ApprovalRequest, AuditEntry, AuditLog,
    DecisionResult,
};
pub use config::{
    AuthConfig, GatewayConfig, Profile, ProfileStore, ProfileSummary, CONFIG_ENV,
    DEFAULT_CONFIG_PATH,
};
pub use error::{ApprovalError, GatewayError, GatewayResult};
pub use orchestrator::{ApprovedExecution, Orchestrator, RunOutcome};
pub use runner::{CommandRunner, ExecutionResult, SshRunner};
pub use server::GatewayServer;
