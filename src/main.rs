use std::sync::Arc;

use anyhow::Result;
use ssh_gatekeeper::{server, Orchestrator, ProfileStore, SshRunner};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP stream; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let profiles = ProfileStore::load()?;
    tracing::info!(profiles = profiles.len(), "ssh-gatekeeper starting");

    let orchestrator = Arc::new(Orchestrator::new(profiles, Arc::new(SshRunner::new())));
    server::serve_stdio(orchestrator).await
}
