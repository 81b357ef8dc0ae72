//! Request orchestration.
//!
//! Single entry point for the four exposed operations. A command-execution
//! request either passes the allowlist and executes immediately, or parks as
//! a pending approval; a later decision consumes the approval exactly once
//! and executes the original command. All store mutation (consuming the
//! approval, persisting a learned prefix) happens strictly before the
//! blocking runner call, so a slow or failed execution never leaves approval
//! state inconsistent.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    allowlist::{suggest_prefix, AllowlistMatcher, SessionAllowlist},
    approval::{
        audit::{AuditLog, DecisionResult},
        manager::{ApprovalDecision, ApprovalManager, ApprovalRequest},
    },
    config::{ProfileStore, ProfileSummary},
    error::GatewayResult,
    runner::{CommandRunner, ExecutionResult},
};

/// Outcome of a command-execution request.
#[derive(Debug)]
pub enum RunOutcome {
    /// The command was authorized and ran to completion (any exit code).
    Executed(ExecutionResult),
    /// The command needs an operator decision before it can run.
    ApprovalRequired(ApprovalRequest),
}

/// Outcome of an approval decision, carrying which choice was applied.
#[derive(Debug)]
pub struct ApprovedExecution {
    pub decision: &'static str,
    pub result: ExecutionResult,
}

/// Sequences profile resolution, allowlist matching, approval lifecycle,
/// and remote execution. Safe to share across concurrent tool calls; the
/// only synchronization lives inside the session allowlist and the
/// pending-approval store.
pub struct Orchestrator {
    profiles: ProfileStore,
    session: Arc<SessionAllowlist>,
    matcher: AllowlistMatcher,
    approvals: ApprovalManager,
    audit: Arc<AuditLog>,
    runner: Arc<dyn CommandRunner>,
}

impl Orchestrator {
    pub fn new(profiles: ProfileStore, runner: Arc<dyn CommandRunner>) -> Self {
        let session = Arc::new(SessionAllowlist::new());
        let audit = Arc::new(AuditLog::new());
        Self {
            profiles,
            matcher: AllowlistMatcher::new(session.clone()),
            session,
            approvals: ApprovalManager::new(audit.clone()),
            audit,
            runner,
        }
    }

    /// Profile summaries for `ssh_list_profiles`. No side effects.
    pub fn list_profiles(&self) -> Vec<ProfileSummary> {
        self.profiles.list()
    }

    /// Entry point for `ssh_run_command`: validate, check the allowlist,
    /// then execute immediately or park a pending approval.
    pub async fn run_command(
        &self,
        profile_name: &str,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> GatewayResult<RunOutcome> {
        let profile = self.profiles.get(profile_name)?;
        let command = profile.validate_command(command)?;

        match self
            .matcher
            .authorization(&profile.name, &profile.allowlist, &command)
        {
            Some(source) => {
                self.audit.record_decision(
                    &profile.name,
                    &command,
                    DecisionResult::Authorized,
                    source,
                );
                info!(profile = %profile.name, %command, ?source, "command authorized");
                let result = self.execute(&profile, &command, timeout_secs).await?;
                Ok(RunOutcome::Executed(result))
            }
            None => {
                let prefix = suggest_prefix(&command);
                let request = self.approvals.create_pending(&profile.name, &command, &prefix);
                info!(
                    profile = %profile.name,
                    %command,
                    approval_id = %request.approval_id,
                    "approval required"
                );
                Ok(RunOutcome::ApprovalRequired(request))
            }
        }
    }

    /// Entry point for `ssh_approve_and_run`: consume the approval (single
    /// use), persist the prefix for `allow_prefix`, then run the original
    /// command. The decision is applied before execution, never after.
    pub async fn approve_and_run(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        timeout_secs: Option<u64>,
    ) -> GatewayResult<ApprovedExecution> {
        let grant = match self.approvals.resolve(approval_id, &decision) {
            Ok(grant) => grant,
            Err(err) => {
                warn!(approval_id, error = %err, "approval resolution failed");
                return Err(err.into());
            }
        };

        let profile = self.profiles.get(&grant.profile)?;
        if let Some(prefix) = grant.persist_prefix.as_deref() {
            self.session.add_prefix(&grant.profile, prefix);
        }
        info!(
            profile = %grant.profile,
            command = %grant.command,
            decision = grant.decision,
            "approval accepted"
        );

        // The original command, never the prefix, is what runs.
        let command = profile.validate_command(&grant.command)?;
        let result = self.execute(&profile, &command, timeout_secs).await?;
        Ok(ApprovedExecution {
            decision: grant.decision,
            result,
        })
    }

    /// Entry point for `ssh_clear_session_allowlist`. Pending approvals are
    /// unaffected; only learned prefixes are dropped.
    pub fn clear_session_allowlist(&self, profile: Option<&str>) -> usize {
        let cleared = self.session.clear(profile);
        info!(profile = profile.unwrap_or("*"), cleared, "session allowlist cleared");
        cleared
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn session_allowlist(&self) -> &Arc<SessionAllowlist> {
        &self.session
    }

    async fn execute(
        &self,
        profile: &crate::config::Profile,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> GatewayResult<ExecutionResult> {
        let timeout = profile.limits.resolve_timeout(timeout_secs);
        let mut result = self.runner.run(profile, command, timeout).await?;
        result.truncate_output(profile.limits.max_output_chars);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        allowlist::AuthorizationSource,
        config::{GatewayConfig, Profile},
        error::{ApprovalError, GatewayError},
    };

    /// Records calls and replays a canned response.
    struct MockRunner {
        calls: Mutex<Vec<(String, String, Duration)>>,
        response: Box<dyn Fn() -> GatewayResult<ExecutionResult> + Send + Sync>,
    }

    impl MockRunner {
        fn ok() -> Self {
            Self::with_response(|| {
                Ok(ExecutionResult {
                    stdout: "out".to_string(),
                    exit_code: Some(0),
                    ..Default::default()
                })
            })
        }

        fn with_response(
            response: impl Fn() -> GatewayResult<ExecutionResult> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                response: Box::new(response),
            }
        }

        fn calls(&self) -> Vec<(String, String, Duration)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(
            &self,
            profile: &Profile,
            command: &str,
            timeout: Duration,
        ) -> GatewayResult<ExecutionResult> {
            self.calls
                .lock()
                .unwrap()
                .push((profile.name.clone(), command.to_string(), timeout));
            (self.response)()
        }
    }

    fn test_orchestrator(runner: Arc<MockRunner>) -> Orchestrator {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "defaults": {"default_timeout_secs": 30, "max_timeout_secs": 60},
                "profiles": {
                    "db1": {
                        "host": "db1.internal",
                        "username": "deploy",
                        "allowed_commands": ["uptime"],
                        "allowed_prefixes": ["systemctl status"],
                        "deny_regexes": ["rm\\s+-rf"]
                    }
                }
            }"#,
        )
        .unwrap();
        Orchestrator::new(ProfileStore::from_config(config).unwrap(), runner)
    }

    async fn park_approval(orch: &Orchestrator, command: &str) -> ApprovalRequest {
        match orch.run_command("db1", command, None).await.unwrap() {
            RunOutcome::ApprovalRequired(req) => req,
            RunOutcome::Executed(_) => panic!("expected approval requirement"),
        }
    }

    #[tokio::test]
    async fn test_static_exact_executes_directly() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());

        let outcome = orch.run_command("db1", "uptime", None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Executed(_)));
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "uptime");
        assert_eq!(calls[0].2, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_static_prefix_executes_directly() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());

        let outcome = orch
            .run_command("db1", "systemctl status nginx", None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_unlisted_command_parks_approval() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());

        let req = park_approval(&orch, "git pull origin main").await;
        assert_eq!(req.suggested_prefix, "git pull");
        assert_eq!(req.choices, vec!["allow_once", "allow_prefix"]);
        assert!(runner.calls().is_empty());

        // No deduplication: a second identical request parks a fresh id.
        let req2 = park_approval(&orch, "git pull origin main").await;
        assert_ne!(req.approval_id, req2.approval_id);
    }

    #[tokio::test]
    async fn test_allow_once_executes_without_learning() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());
        let req = park_approval(&orch, "git pull origin main").await;

        let approved = orch
            .approve_and_run(&req.approval_id, ApprovalDecision::AllowOnce, None)
            .await
            .unwrap();
        assert_eq!(approved.decision, "allow_once");
        // Original command ran, not the prefix.
        assert_eq!(runner.calls()[0].1, "git pull origin main");
        assert!(orch.session_allowlist().is_empty());

        // A matching follow-up still needs approval.
        let outcome = orch
            .run_command("db1", "git pull upstream dev", None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::ApprovalRequired(_)));
    }

    #[tokio::test]
    async fn test_allow_prefix_learns_for_session() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());
        let req = park_approval(&orch, "git pull origin main").await;

        orch.approve_and_run(&req.approval_id, ApprovalDecision::AllowPrefix { prefix: None }, None)
            .await
            .unwrap();
        assert_eq!(orch.session_allowlist().prefixes_for("db1"), vec!["git pull"]);

        // Sharing the learned prefix now executes directly.
        let outcome = orch
            .run_command("db1", "git pull upstream dev", None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Executed(_)));
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_second_decision_fails() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());
        let req = park_approval(&orch, "git pull origin main").await;

        orch.approve_and_run(&req.approval_id, ApprovalDecision::AllowOnce, None)
            .await
            .unwrap();
        let err = orch
            .approve_and_run(&req.approval_id, ApprovalDecision::AllowOnce, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Approval(ApprovalError::AlreadyConsumed(_))
        ));
        // Only the first decision executed.
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_session_requires_reapproval() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());
        let req = park_approval(&orch, "git pull origin main").await;
        orch.approve_and_run(&req.approval_id, ApprovalDecision::AllowPrefix { prefix: None }, None)
            .await
            .unwrap();

        assert_eq!(orch.clear_session_allowlist(Some("db1")), 1);
        let outcome = orch
            .run_command("db1", "git pull upstream dev", None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::ApprovalRequired(_)));
    }

    #[tokio::test]
    async fn test_unknown_profile_no_state_created() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());

        let err = orch.run_command("nope", "uptime", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownProfile(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());
        let err = orch.run_command("db1", "   ", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_denied_command_rejected_before_allowlist() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());
        let err = orch
            .run_command("db1", "rm -rf /tmp/x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCommand(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_after_prefix_persists() {
        // A failed execution must not roll back the consumed approval or the
        // learned prefix: state mutation happens before the blocking call.
        let runner = Arc::new(MockRunner::with_response(|| {
            Err(GatewayError::Transport("connection refused".to_string()))
        }));
        let orch = test_orchestrator(runner.clone());
        let req = park_approval(&orch, "git pull origin main").await;

        let err = orch
            .approve_and_run(&req.approval_id, ApprovalDecision::AllowPrefix { prefix: None }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert_eq!(orch.session_allowlist().prefixes_for("db1"), vec!["git pull"]);

        let err = orch
            .approve_and_run(&req.approval_id, ApprovalDecision::AllowOnce, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Approval(ApprovalError::AlreadyConsumed(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_clamped_to_profile_max() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());
        orch.run_command("db1", "uptime", Some(600)).await.unwrap();
        assert_eq!(runner.calls()[0].2, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_output_truncated_to_profile_limit() {
        let runner = Arc::new(MockRunner::with_response(|| {
            Ok(ExecutionResult {
                stdout: "x".repeat(30_000),
                exit_code: Some(0),
                ..Default::default()
            })
        }));
        let orch = test_orchestrator(runner);
        match orch.run_command("db1", "uptime", None).await.unwrap() {
            RunOutcome::Executed(result) => {
                assert!(result.stdout_truncated);
                assert!(result.stdout.len() < 30_000);
            }
            RunOutcome::ApprovalRequired(_) => panic!("expected execution"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let runner = Arc::new(MockRunner::with_response(|| {
            Ok(ExecutionResult {
                stderr: "fatal: not a git repository".to_string(),
                exit_code: Some(128),
                ..Default::default()
            })
        }));
        let orch = test_orchestrator(runner);
        match orch.run_command("db1", "uptime", None).await.unwrap() {
            RunOutcome::Executed(result) => assert_eq!(result.exit_code, Some(128)),
            RunOutcome::ApprovalRequired(_) => panic!("expected execution"),
        }
    }

    #[tokio::test]
    async fn test_audit_trail() {
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner);

        orch.run_command("db1", "uptime", None).await.unwrap();
        let req = park_approval(&orch, "git pull origin main").await;
        orch.approve_and_run(&req.approval_id, ApprovalDecision::AllowOnce, None)
            .await
            .unwrap();

        let entries = orch.audit_log().recent(10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].result, DecisionResult::Approved);
        assert_eq!(entries[1].result, DecisionResult::Pending);
        assert_eq!(entries[2].result, DecisionResult::Authorized);
        assert_eq!(entries[2].source, AuthorizationSource::StaticExact);
    }

    #[tokio::test]
    async fn test_full_scenario() {
        // The end-to-end walk from the design notes: static rule, approval,
        // prefix learning, session clear, approval again.
        let runner = Arc::new(MockRunner::ok());
        let orch = test_orchestrator(runner.clone());

        let outcome = orch.run_command("db1", "uptime", None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Executed(_)));

        let req = park_approval(&orch, "git pull origin main").await;
        assert_eq!(req.suggested_prefix, "git pull");

        orch.approve_and_run(&req.approval_id, ApprovalDecision::AllowPrefix { prefix: None }, None)
            .await
            .unwrap();

        let outcome = orch
            .run_command("db1", "git pull upstream dev", None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Executed(_)));

        orch.clear_session_allowlist(Some("db1"));
        let outcome = orch
            .run_command("db1", "git pull upstream dev", None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::ApprovalRequired(_)));
    }
}
