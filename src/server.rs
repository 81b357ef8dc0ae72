//! MCP tool surface.
//!
//! Exposes the four gateway operations as MCP tools over stdio. Every error
//! is returned to the caller as a structured `{ok: false, error, kind}`
//! payload; nothing is retried here.

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    approval::manager::ApprovalDecision,
    error::GatewayError,
    orchestrator::{Orchestrator, RunOutcome},
    runner::ExecutionResult,
};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCommandRequest {
    /// Profile to run against.
    pub profile: String,
    /// Command line to execute remotely.
    pub command: String,
    /// Timeout in seconds; clamped to the profile's maximum.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ApproveAndRunRequest {
    /// Approval id returned by a previous ssh_run_command call.
    pub approval_id: String,
    /// Either "allow_once" or "allow_prefix".
    pub decision: String,
    /// Prefix to persist for allow_prefix; defaults to the suggested one.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ClearSessionAllowlistRequest {
    /// Profile to clear; omit to clear every profile.
    #[serde(default)]
    pub profile: Option<String>,
}

/// MCP server wrapping an [`Orchestrator`].
#[derive(Clone)]
pub struct GatewayServer {
    orchestrator: Arc<Orchestrator>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GatewayServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "List configured remote host profiles")]
    fn ssh_list_profiles(&self) -> Result<CallToolResult, McpError> {
        json_result(&json!({
            "ok": true,
            "profiles": self.orchestrator.list_profiles(),
        }))
    }

    #[tool(
        description = "Run a command on a profile's remote host. Commands outside the \
                       allowlist return an approval_id for ssh_approve_and_run."
    )]
    async fn ssh_run_command(
        &self,
        Parameters(req): Parameters<RunCommandRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .orchestrator
            .run_command(&req.profile, &req.command, req.timeout_secs)
            .await
        {
            Ok(RunOutcome::Executed(result)) => json_result(&execution_payload(&result, None)),
            Ok(RunOutcome::ApprovalRequired(request)) => json_result(&json!({
                "ok": false,
                "approval_required": true,
                "approval_id": request.approval_id,
                "choices": request.choices,
                "suggested_prefix": request.suggested_prefix,
                "message": request.message,
            })),
            Err(err) => json_result(&error_payload(&err)),
        }
    }

    #[tool(
        description = "Resolve a pending approval (allow_once or allow_prefix) and run the \
                       original command. Each approval_id is usable exactly once."
    )]
    async fn ssh_approve_and_run(
        &self,
        Parameters(req): Parameters<ApproveAndRunRequest>,
    ) -> Result<CallToolResult, McpError> {
        let decision = match ApprovalDecision::from_wire(&req.decision, req.prefix) {
            Ok(decision) => decision,
            Err(err) => return json_result(&error_payload(&err.into())),
        };
        match self
            .orchestrator
            .approve_and_run(&req.approval_id, decision, req.timeout_secs)
            .await
        {
            Ok(approved) => {
                json_result(&execution_payload(&approved.result, Some(approved.decision)))
            }
            Err(err) => json_result(&error_payload(&err)),
        }
    }

    #[tool(description = "Clear session-learned command prefixes for one profile or all")]
    fn ssh_clear_session_allowlist(
        &self,
        Parameters(req): Parameters<ClearSessionAllowlistRequest>,
    ) -> Result<CallToolResult, McpError> {
        let cleared = self
            .orchestrator
            .clear_session_allowlist(req.profile.as_deref());
        json_result(&json!({
            "ok": true,
            "profile": req.profile,
            "cleared": cleared,
        }))
    }
}

#[tool_handler]
impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Allowlist-gated remote command execution. Commands outside a profile's \
                 allowlist require operator approval via ssh_approve_and_run."
                    .to_string(),
            ),
        }
    }
}

/// Serve the gateway over stdio until the client disconnects.
pub async fn serve_stdio(orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let service = GatewayServer::new(orchestrator).serve(stdio()).await?;
    info!("gateway serving on stdio");
    service.waiting().await?;
    Ok(())
}

fn json_result(value: &serde_json::Value) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| McpError::internal_error(err.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn execution_payload(result: &ExecutionResult, approved: Option<&str>) -> serde_json::Value {
    let mut payload = json!({
        "ok": true,
        "stdout": result.stdout,
        "stderr": result.stderr,
        "exit_code": result.exit_code,
        "exit_signal": result.exit_signal,
        "duration_ms": result.duration_ms,
        "stdout_truncated": result.stdout_truncated,
        "stderr_truncated": result.stderr_truncated,
    });
    if let Some(decision) = approved {
        payload["approved"] = json!(decision);
    }
    payload
}

fn error_payload(err: &GatewayError) -> serde_json::Value {
    json!({
        "ok": false,
        "error": err.to_string(),
        "kind": err.kind(),
    })
}
