//! Client configuration.
//!
//! Loaded from a YAML file with `${VAR}` / `${VAR:-default}` interpolation,
//! or built from the environment (after reading `.env`) for the default
//! git-repo-research server.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp_client::resolver::{Resolver, ToolOverride};
use crate::mcp_client::transport::{Launcher, ProcessLauncher};
use crate::mcp_client::types::{OperationIntent, ServerConfig};
use crate::mcp_client::McpError;

// ─── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_SERVER_NAME: &str = "git-repo-research";
pub const DEFAULT_SERVER_COMMAND: &str = "uvx";
pub const DEFAULT_SERVER_PACKAGE: &str = "awslabs.git-repo-research-mcp-server@latest";

/// Placeholder value shipped in example `.env` files.
const TOKEN_PLACEHOLDER: &str = "your-github-token";

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

// ─── Sections ────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Per-call deadlines, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Repository indexing (clone + embed) is slow.
    pub index_ms: u64,
    /// Semantic and pattern search.
    pub search_ms: u64,
    /// File reads, structure listings and discovery.
    pub metadata_ms: u64,
    /// The `initialize` handshake.
    pub init_ms: u64,
    /// Health probe.
    pub probe_ms: u64,
    /// A process that exits within this window failed to launch.
    pub startup_grace_ms: u64,
    /// How long a stopped server gets to exit before it is killed.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            index_ms: 600_000,
            search_ms: 120_000,
            metadata_ms: 30_000,
            init_ms: 30_000,
            probe_ms: 10_000,
            startup_grace_ms: 250,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    /// Deadline for a tool call carrying out `intent`.
    pub fn for_intent(&self, intent: OperationIntent) -> Duration {
        let ms = match intent {
            OperationIntent::Index => self.index_ms,
            OperationIntent::SemanticSearch | OperationIntent::CodeSearch => self.search_ms,
            OperationIntent::ReadFile | OperationIntent::GetStructure => self.metadata_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn metadata(&self) -> Duration {
        Duration::from_millis(self.metadata_ms)
    }

    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Health monitoring and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_ms: u64,
    /// Reconnect attempts before giving up and going Disconnected.
    pub max_reconnect_attempts: u32,
    /// Delay before the first attempt; doubles for each later one.
    pub reconnect_base_delay_ms: u64,
    /// Probe intervals without a successful probe before a Ready connection
    /// counts as stale.
    pub staleness_intervals: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 1_000,
            staleness_intervals: 3,
        }
    }
}

impl HealthConfig {
    /// Never zero: a zero period cannot drive an interval timer.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn staleness_window(&self) -> Duration {
        self.probe_interval() * self.staleness_intervals.max(1)
    }

    /// Backoff before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.reconnect_base_delay_ms).saturating_mul(factor)
    }
}

/// Server-specific tool knowledge added on top of the built-in tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Extra aliases per intent, tried before the built-in ones.
    pub aliases: BTreeMap<OperationIntent, Vec<String>>,
    /// Parameter overrides by exact tool name; replaces a built-in override
    /// for the same name.
    pub overrides: HashMap<String, ToolOverride>,
}

impl ResolverConfig {
    pub fn build_resolver(&self) -> Resolver {
        let mut resolver = Resolver::default();
        for (intent, names) in &self.aliases {
            resolver = resolver.with_aliases(*intent, names.clone());
        }
        for (tool, rules) in &self.overrides {
            resolver = resolver.with_override(tool, rules.clone());
        }
        resolver
    }
}

// ─── Construction ────────────────────────────────────────────────────────────

impl ClientConfig {
    /// Default server invocation with credentials taken from the environment.
    ///
    /// Reads `.env` from the working directory first, if present.
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.to_string());

        let mut env = HashMap::new();
        env.insert("AWS_PROFILE".to_string(), var("AWS_PROFILE", "default"));
        env.insert("AWS_REGION".to_string(), var("AWS_REGION", "us-west-2"));
        env.insert("FASTMCP_LOG_LEVEL".to_string(), var("FASTMCP_LOG_LEVEL", "ERROR"));
        env.insert("GITHUB_TOKEN".to_string(), var("GITHUB_TOKEN", ""));

        Self {
            server_name: default_server_name(),
            server: ServerConfig {
                command: DEFAULT_SERVER_COMMAND.to_string(),
                args: vec![DEFAULT_SERVER_PACKAGE.to_string()],
                env,
                cwd: None,
            },
            timeouts: TimeoutConfig::default(),
            health: HealthConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }

    /// Human-readable problems that will stop the server from working.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = self.fatal_issues();

        match self.server.env.get("GITHUB_TOKEN").map(|t| t.trim()) {
            None | Some("") => issues.push(
                "GITHUB_TOKEN is not set; add GITHUB_TOKEN=<token> to your .env file".to_string(),
            ),
            Some(TOKEN_PLACEHOLDER) => issues.push(format!(
                "GITHUB_TOKEN is still the placeholder '{TOKEN_PLACEHOLDER}'; replace it with a real token"
            )),
            Some(_) => {}
        }

        issues
    }

    /// Reject a configuration the client cannot run with at all.
    ///
    /// Credential problems are left to `validate`; the server reports them
    /// itself when it starts.
    pub fn check(&self) -> Result<(), McpError> {
        let issues = self.fatal_issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(McpError::ConfigError {
                reason: issues.join("; "),
            })
        }
    }

    fn fatal_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.server.command.trim().is_empty() {
            issues.push("server command is empty".to_string());
        }
        if self.health.probe_interval_ms == 0 {
            issues.push("health.probe_interval_ms must be greater than zero".to_string());
        }
        let t = &self.timeouts;
        for (name, value) in [
            ("index_ms", t.index_ms),
            ("search_ms", t.search_ms),
            ("metadata_ms", t.metadata_ms),
            ("init_ms", t.init_ms),
            ("probe_ms", t.probe_ms),
        ] {
            if value == 0 {
                issues.push(format!("timeouts.{name} must be greater than zero"));
            }
        }

        issues
    }

    /// Launcher that spawns the configured server process.
    pub fn build_launcher(&self) -> Arc<dyn Launcher> {
        let mut server = self.server.clone();
        server.cwd = server.cwd.as_deref().map(expand_tilde);
        Arc::new(ProcessLauncher::new(
            &self.server_name,
            server,
            self.timeouts.startup_grace(),
            self.timeouts.shutdown_grace(),
        ))
    }
}

/// Conventional config file location: `<config dir>/reposcope/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("reposcope").join("config.yaml"))
}

/// Load and parse a YAML config file.
pub fn load_client_config(path: &Path) -> Result<ClientConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let config: ClientConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;

    tracing::info!(
        path = %path.display(),
        server = %config.server_name,
        command = %config.server.command,
        "loaded client config"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`; unset variables without a default become empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
