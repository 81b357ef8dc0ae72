//! Remote command execution.
//!
//! [`CommandRunner`] is the seam between the policy engine and the remote
//! shell transport. [`SshRunner`] drives one blocking `ssh2` session per
//! execution from the blocking pool, bounded by `tokio::time::timeout`.
//! Connection, authentication, and timeout failures surface as
//! [`GatewayError::Transport`]; a command that ran and exited non-zero is a
//! normal [`ExecutionResult`].

use std::{
    io::Read,
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use ssh2::Session;
use tracing::debug;

use crate::{
    config::{AuthConfig, Profile},
    error::{GatewayError, GatewayResult},
};

/// Outcome of a remote execution that reached the command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Remote exit code; `None` when the command was killed by a signal.
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Cap both streams at `max_chars`, appending a marker noting how much
    /// was dropped.
    pub fn truncate_output(&mut self, max_chars: usize) {
        self.stdout_truncated |= truncate(&mut self.stdout, max_chars);
        self.stderr_truncated |= truncate(&mut self.stderr, max_chars);
    }
}

fn truncate(text: &mut String, max_chars: usize) -> bool {
    let total = text.chars().count();
    if total <= max_chars {
        return false;
    }
    let kept: String = text.chars().take(max_chars).collect();
    let dropped = total - max_chars;
    *text = format!("{kept}\n...[truncated {dropped} chars]");
    true
}

/// Executes an authorized command against a profile's remote host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        profile: &Profile,
        command: &str,
        timeout: Duration,
    ) -> GatewayResult<ExecutionResult>;
}

/// `ssh2`-backed runner: one session per execution, no connection reuse.
#[derive(Debug, Default)]
pub struct SshRunner;

impl SshRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(
        &self,
        profile: &Profile,
        command: &str,
        timeout: Duration,
    ) -> GatewayResult<ExecutionResult> {
        if profile.host.is_empty() || profile.username.is_empty() {
            return Err(GatewayError::Config(format!(
                "profile {} must define host and username",
                profile.name
            )));
        }

        let command = prepare_command(profile, command)?;
        let profile = profile.clone();
        let started = Instant::now();
        debug!(profile = %profile.name, host = %profile.host, "executing remote command");

        let handle = tokio::task::spawn_blocking(move || exec_blocking(&profile, &command, timeout));
        let result = match tokio::time::timeout(timeout, handle).await {
            Err(_) => Err(GatewayError::Transport(format!(
                "command timed out after {}s",
                timeout.as_secs()
            ))),
            Ok(Err(join_err)) => Err(GatewayError::Transport(format!(
                "execution task failed: {join_err}"
            ))),
            Ok(Ok(result)) => result,
        };

        result.map(|mut r| {
            r.duration_ms = started.elapsed().as_millis() as u64;
            r
        })
    }
}

/// Prepend the profile's working directory, shell-quoted.
fn prepare_command(profile: &Profile, command: &str) -> GatewayResult<String> {
    match profile.working_dir.as_deref() {
        Some(dir) => {
            let quoted = shlex::try_quote(dir).map_err(|_| {
                GatewayError::Config(format!(
                    "profile {}: working_dir is not quotable",
                    profile.name
                ))
            })?;
            Ok(format!("cd {quoted} && {command}"))
        }
        None => Ok(command.to_string()),
    }
}

fn exec_blocking(profile: &Profile, command: &str, timeout: Duration) -> GatewayResult<ExecutionResult> {
    let session = connect(profile, timeout)?;

    let mut channel = session
        .channel_session()
        .map_err(|err| GatewayError::Transport(format!("failed to open channel: {err}")))?;
    channel
        .exec(command)
        .map_err(|err| GatewayError::Transport(format!("failed to start command: {err}")))?;

    // libssh2 buffers the extended (stderr) stream internally while the main
    // stream is drained, so sequential reads are safe here.
    let mut stdout_buf = Vec::new();
    channel
        .read_to_end(&mut stdout_buf)
        .map_err(|err| GatewayError::Transport(format!("failed reading stdout: {err}")))?;
    let mut stderr_buf = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr_buf)
        .map_err(|err| GatewayError::Transport(format!("failed reading stderr: {err}")))?;

    let _ = channel.wait_close();
    let exit_code = channel.exit_status().ok();
    let exit_signal = channel
        .exit_signal()
        .ok()
        .and_then(|signal| signal.exit_signal);

    Ok(ExecutionResult {
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        // A signal-terminated command reports no exit code.
        exit_code: if exit_signal.is_some() { None } else { exit_code },
        exit_signal,
        duration_ms: 0,
        stdout_truncated: false,
        stderr_truncated: false,
    })
}

fn connect(profile: &Profile, timeout: Duration) -> GatewayResult<Session> {
    let addr = (profile.host.as_str(), profile.port)
        .to_socket_addrs()
        .map_err(|err| {
            GatewayError::Transport(format!(
                "cannot resolve {}:{}: {err}",
                profile.host, profile.port
            ))
        })?
        .next()
        .ok_or_else(|| {
            GatewayError::Transport(format!(
                "no address for {}:{}",
                profile.host, profile.port
            ))
        })?;

    let tcp = TcpStream::connect_timeout(&addr, profile.limits.connect_timeout)
        .map_err(|err| GatewayError::Transport(format!("connect to {addr} failed: {err}")))?;

    let mut session = Session::new()
        .map_err(|err| GatewayError::Transport(format!("failed to create session: {err}")))?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| GatewayError::Transport(format!("handshake failed: {err}")))?;

    verify_host_key(profile, &session)?;
    authenticate(profile, &session)?;
    Ok(session)
}

fn verify_host_key(profile: &Profile, session: &Session) -> GatewayResult<()> {
    let Some(expected) = profile.host_key_fingerprint_sha256.as_deref() else {
        return Ok(());
    };
    let observed = session
        .host_key_hash(ssh2::HashType::Sha256)
        .map(|hash| format!("SHA256:{}", STANDARD_NO_PAD.encode(hash)))
        .ok_or_else(|| GatewayError::Transport("host key unavailable".to_string()))?;
    if observed != expected {
        return Err(GatewayError::Transport(format!(
            "host key mismatch for {} (expected {expected}, got {observed})",
            profile.name
        )));
    }
    Ok(())
}

fn authenticate(profile: &Profile, session: &Session) -> GatewayResult<()> {
    match resolve_auth(&profile.auth)? {
        ResolvedAuth::KeyFile { path, passphrase } => session
            .userauth_pubkey_file(&profile.username, None, &path, passphrase.as_deref())
            .map_err(|err| GatewayError::Transport(format!("key authentication failed: {err}")))?,
        ResolvedAuth::Password(password) => session
            .userauth_password(&profile.username, &password)
            .map_err(|err| {
                GatewayError::Transport(format!("password authentication failed: {err}"))
            })?,
    }
    if !session.authenticated() {
        return Err(GatewayError::Transport("authentication failed".to_string()));
    }
    Ok(())
}

enum ResolvedAuth {
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

/// Resolve credential references at execution time. Env-named fields take
/// precedence over literal config values.
fn resolve_auth(auth: &AuthConfig) -> GatewayResult<ResolvedAuth> {
    match auth {
        AuthConfig::Key {
            private_key_path,
            private_key_path_env,
            passphrase_env,
        } => {
            let path = private_key_path_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .or_else(|| private_key_path.clone())
                .ok_or_else(|| GatewayError::Config("SSH key path not configured".to_string()))?;
            let passphrase = passphrase_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok());
            Ok(ResolvedAuth::KeyFile {
                path: PathBuf::from(path),
                passphrase,
            })
        }
        AuthConfig::Password {
            password,
            password_env,
        } => {
            let password = password_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .or_else(|| password.clone())
                .ok_or_else(|| GatewayError::Config("SSH password not configured".to_string()))?;
            Ok(ResolvedAuth::Password(password))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, ProfileStore};

    fn test_profile(extra: serde_json::Value) -> Profile {
        let mut profile = serde_json::json!({"host": "h", "username": "u"});
        profile
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        let config: GatewayConfig =
            serde_json::from_value(serde_json::json!({"profiles": {"p": profile}})).unwrap();
        let store = ProfileStore::from_config(config).unwrap();
        store.get("p").unwrap().as_ref().clone()
    }

    #[test]
    fn test_prepare_command_no_working_dir() {
        let profile = test_profile(serde_json::json!({}));
        assert_eq!(prepare_command(&profile, "uptime").unwrap(), "uptime");
    }

    #[test]
    fn test_prepare_command_quotes_working_dir() {
        let profile = test_profile(serde_json::json!({"working_dir": "/srv/my app"}));
        assert_eq!(
            prepare_command(&profile, "git status").unwrap(),
            "cd '/srv/my app' && git status"
        );
    }

    #[test]
    fn test_truncate_output() {
        let mut result = ExecutionResult {
            stdout: "abcdef".to_string(),
            stderr: "ok".to_string(),
            ..Default::default()
        };
        result.truncate_output(4);
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
        assert_eq!(result.stdout, "abcd\n...[truncated 2 chars]");
        assert_eq!(result.stderr, "ok");
    }

    #[test]
    fn test_truncate_is_char_aware() {
        let mut result = ExecutionResult {
            stdout: "héllo wörld".to_string(),
            ..Default::default()
        };
        result.truncate_output(5);
        assert!(result.stdout.starts_with("héllo"));
    }

    #[test]
    fn test_resolve_auth_key_env_precedence() {
        std::env::set_var("GK_TEST_KEY_PATH", "/tmp/env-key");
        let auth = AuthConfig::Key {
            private_key_path: Some("/tmp/file-key".to_string()),
            private_key_path_env: Some("GK_TEST_KEY_PATH".to_string()),
            passphrase_env: None,
        };
        match resolve_auth(&auth).unwrap() {
            ResolvedAuth::KeyFile { path, passphrase } => {
                assert_eq!(path, PathBuf::from("/tmp/env-key"));
                assert!(passphrase.is_none());
            }
            ResolvedAuth::Password(_) => panic!("expected key auth"),
        }
    }

    #[test]
    fn test_resolve_auth_missing_key_path() {
        let auth = AuthConfig::Key {
            private_key_path: None,
            private_key_path_env: None,
            passphrase_env: None,
        };
        assert!(matches!(
            resolve_auth(&auth),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_auth_password_literal() {
        let auth = AuthConfig::Password {
            password: Some("hunter2".to_string()),
            password_env: None,
        };
        match resolve_auth(&auth).unwrap() {
            ResolvedAuth::Password(pw) => assert_eq!(pw, "hunter2"),
            ResolvedAuth::KeyFile { .. } => panic!("expected password auth"),
        }
    }

    #[tokio::test]
    async fn test_run_rejects_incomplete_profile() {
        let profile = test_profile(serde_json::json!({"host": ""}));
        let err = SshRunner::new()
            .run(&profile, "uptime", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
