//! Profile configuration and the read-only [`ProfileStore`].
//!
//! Profiles are loaded once at startup from a JSON file (`ssh_profiles.json`
//! by default, overridable through `SSH_GATEKEEPER_CONFIG`) and frozen: the
//! store hands out [`Profile`] values with compiled regex lists and merged
//! defaults, and is never mutated afterwards. Credential material is kept as
//! references (paths, env var names) and resolved only at execution time.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    allowlist::StaticAllowlist,
    error::{GatewayError, GatewayResult},
};

/// Environment variable selecting an alternate config file.
pub const CONFIG_ENV: &str = "SSH_GATEKEEPER_CONFIG";
/// Default config path relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "ssh_profiles.json";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Defaults merged field-wise into every profile.
    #[serde(default)]
    pub defaults: ProfileDefaults,

    /// Named profiles. `hosts` is accepted as an alias for compatibility.
    #[serde(default, alias = "hosts")]
    pub profiles: HashMap<String, ProfileConfig>,
}

/// Tunables a profile may override individually.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileDefaults {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            port: default_port(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_output_chars: default_max_output_chars(),
            max_command_length: default_max_command_length(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Remote directory every command is run from (`cd <dir> && <command>`).
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Pinned SHA-256 host key fingerprint (`SHA256:<base64>`); the
    /// connection is rejected on mismatch.
    #[serde(default)]
    pub host_key_fingerprint_sha256: Option<String>,

    /// Exact-match allowlist entries.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Token-boundary prefix allowlist entries.
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
    /// Regex allowlist entries.
    #[serde(default)]
    pub allowed_regexes: Vec<String>,
    /// Commands matching any of these are rejected outright, before the
    /// allowlist is consulted.
    #[serde(default)]
    pub deny_regexes: Vec<String>,
    /// Authorize every command for this profile. Deny regexes still apply.
    #[serde(default)]
    pub allow_any_command: bool,

    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_output_chars: Option<usize>,
    #[serde(default)]
    pub max_command_length: Option<usize>,
}

/// How to authenticate against the remote host. Env-named fields are read at
/// execution time so rotated secrets are picked up without a reload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Key {
        #[serde(default)]
        private_key_path: Option<String>,
        /// Env var holding the key path; takes precedence when set.
        #[serde(default)]
        private_key_path_env: Option<String>,
        #[serde(default)]
        passphrase_env: Option<String>,
    },
    Password {
        #[serde(default)]
        password: Option<String>,
        /// Env var holding the password; takes precedence when set.
        #[serde(default)]
        password_env: Option<String>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::Key {
            private_key_path: None,
            private_key_path_env: None,
            passphrase_env: None,
        }
    }
}

/// Per-profile execution limits with defaults applied.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_output_chars: usize,
    pub max_command_length: usize,
}

impl ExecutionLimits {
    /// Clamp a requested timeout into `[1s, max_timeout]`, falling back to
    /// the profile default when the caller does not ask for one.
    pub fn resolve_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let requested = requested_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        requested.min(self.max_timeout).max(Duration::from_secs(1))
    }
}

/// A resolved, immutable profile. Owned by the [`ProfileStore`].
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub description: String,
    pub auth: AuthConfig,
    pub working_dir: Option<String>,
    pub host_key_fingerprint_sha256: Option<String>,
    pub allowlist: StaticAllowlist,
    pub deny_patterns: Vec<Regex>,
    pub limits: ExecutionLimits,
}

impl Profile {
    fn from_config(name: &str, cfg: ProfileConfig, defaults: &ProfileDefaults) -> GatewayResult<Self> {
        let patterns = compile_patterns(name, "allowed_regexes", &cfg.allowed_regexes)?;
        let deny_patterns = compile_patterns(name, "deny_regexes", &cfg.deny_regexes)?;

        Ok(Self {
            name: name.to_string(),
            host: cfg.host,
            port: cfg.port.unwrap_or(defaults.port),
            username: cfg.username,
            description: cfg.description,
            auth: cfg.auth,
            working_dir: cfg.working_dir,
            host_key_fingerprint_sha256: cfg.host_key_fingerprint_sha256,
            allowlist: StaticAllowlist {
                allow_any: cfg.allow_any_command,
                exact: cfg.allowed_commands,
                prefixes: cfg.allowed_prefixes,
                patterns,
            },
            deny_patterns,
            limits: ExecutionLimits {
                default_timeout: Duration::from_secs(
                    cfg.default_timeout_secs.unwrap_or(defaults.default_timeout_secs),
                ),
                max_timeout: Duration::from_secs(
                    cfg.max_timeout_secs.unwrap_or(defaults.max_timeout_secs),
                ),
                connect_timeout: Duration::from_secs(
                    cfg.connect_timeout_secs.unwrap_or(defaults.connect_timeout_secs),
                ),
                max_output_chars: cfg.max_output_chars.unwrap_or(defaults.max_output_chars),
                max_command_length: cfg
                    .max_command_length
                    .unwrap_or(defaults.max_command_length),
            },
        })
    }

    /// Validate and normalize a raw command for this profile: trimmed,
    /// non-empty, a single line, within the length limit, and not matched by
    /// any deny regex. Deny wins over every allowlist rule.
    pub fn validate_command(&self, raw: &str) -> GatewayResult<String> {
        let cmd = raw.trim();
        if cmd.is_empty() {
            return Err(GatewayError::InvalidCommand("command is empty".to_string()));
        }
        if cmd.contains('\n') || cmd.contains('\r') {
            return Err(GatewayError::InvalidCommand(
                "command must be a single line".to_string(),
            ));
        }
        if cmd.len() > self.limits.max_command_length {
            return Err(GatewayError::InvalidCommand(format!(
                "command too long (max {} chars)",
                self.limits.max_command_length
            )));
        }
        if self.deny_patterns.iter().any(|re| re.is_match(cmd)) {
            return Err(GatewayError::InvalidCommand(
                "command blocked by deny rules".to_string(),
            ));
        }
        Ok(cmd.to_string())
    }
}

fn compile_patterns(profile: &str, field: &str, sources: &[String]) -> GatewayResult<Vec<Regex>> {
    sources
        .iter()
        .map(|src| {
            Regex::new(src).map_err(|err| {
                GatewayError::Config(format!("profile {profile}: bad {field} `{src}`: {err}"))
            })
        })
        .collect()
}

/// Summary row returned by the profile-listing operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub name: String,
    pub host: String,
    pub username: String,
    pub description: String,
}

/// Resolves profile names to connection parameters and static allowlists.
/// Read-only after load.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: HashMap<String, Arc<Profile>>,
}

impl ProfileStore {
    /// Build the store from parsed config, compiling regexes and applying
    /// the defaults section to every profile.
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let mut profiles = HashMap::with_capacity(config.profiles.len());
        for (name, profile_cfg) in config.profiles {
            let profile = Profile::from_config(&name, profile_cfg, &config.defaults)?;
            profiles.insert(name, Arc::new(profile));
        }
        Ok(Self { profiles })
    }

    /// Load from the path named by `SSH_GATEKEEPER_CONFIG`, or the default
    /// `ssh_profiles.json`.
    pub fn load() -> GatewayResult<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> GatewayResult<Self> {
        if !path.is_file() {
            return Err(GatewayError::Config(format!(
                "config file not found: {}. Set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&raw)
            .map_err(|err| GatewayError::Config(format!("{}: {err}", path.display())))?;
        let store = Self::from_config(config)?;
        info!(path = %path.display(), profiles = store.len(), "loaded profile config");
        Ok(store)
    }

    pub fn get(&self, name: &str) -> GatewayResult<Arc<Profile>> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownProfile(name.to_string()))
    }

    /// Profile summaries sorted by name.
    pub fn list(&self) -> Vec<ProfileSummary> {
        let mut out: Vec<ProfileSummary> = self
            .profiles
            .values()
            .map(|p| ProfileSummary {
                name: p.name.clone(),
                host: p.host.clone(),
                username: p.username.clone(),
                description: p.description.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_output_chars() -> usize {
    20_000
}

fn default_max_command_length() -> usize {
    4096
}
