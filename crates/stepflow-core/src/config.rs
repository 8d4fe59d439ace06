use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};

/// Top-level stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub archive: Option<ArchiveConfig>,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Which part of the variable store is sent along with a step request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalsScope {
    /// The whole store.
    #[default]
    All,
    /// Only variables produced by the step's ancestors.
    Ancestors,
}

/// Scheduler limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Maximum number of steps executing at once (1 = serial).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Ceiling on dispatched step attempts per session.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Wall-clock budget per session (0 = unlimited).
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    /// Retry budget for nodes that don't declare their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub globals_scope: GlobalsScope,
    /// Attach the current plan graph to step requests.
    #[serde(default = "default_include_plan_graph")]
    pub include_plan_graph: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_steps: default_max_steps(),
            max_duration_secs: default_max_duration(),
            default_max_retries: default_max_retries(),
            globals_scope: GlobalsScope::default(),
            include_plan_graph: default_include_plan_graph(),
        }
    }
}

fn default_workspace() -> String { "~/.stepflow".to_string() }
fn default_max_concurrency() -> usize { 4 }
fn default_max_steps() -> usize { 50 }
fn default_max_duration() -> u64 { 600 }
fn default_max_retries() -> u32 { 3 }
fn default_include_plan_graph() -> bool { true }

/// Subprocess sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter used to run code variants.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    /// Root under which per-session output directories are created.
    #[serde(default = "default_output_root")]
    pub output_root: String,
    /// Captured stderr is truncated past this many bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_interpreter() -> String { "python3".to_string() }
fn default_sandbox_timeout() -> u64 { 120 }
fn default_output_root() -> String { "media/generated".to_string() }
fn default_max_output_bytes() -> usize { 30_000 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_sandbox_timeout(),
            output_root: default_output_root(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Retry configuration for reasoning backend requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_backend_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_backend_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_backend_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Session archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// SQLite database path. Default: <workspace>/sessions.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.flow.max_concurrency == 0 {
            return Err(StepflowError::Config(
                "flow.max_concurrency must be at least 1".into(),
            ));
        }
        if self.flow.max_steps == 0 {
            return Err(StepflowError::Config(
                "flow.max_steps must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = if self.workspace.is_empty() {
            default_workspace()
        } else {
            self.workspace.clone()
        };
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Archive database path, if archiving is enabled.
    pub fn archive_path(&self) -> Option<PathBuf> {
        let archive = self.archive.as_ref()?;
        Some(match &archive.path {
            Some(p) => PathBuf::from(p),
            None => self.workspace_dir().join("sessions.db"),
        })
    }

    /// JSONL log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(p) => PathBuf::from(p),
            None => self.workspace_dir().join("logs"),
        })
    }

    /// Wall-clock budget for a session, if bounded.
    pub fn session_budget(&self) -> Option<std::time::Duration> {
        match self.flow.max_duration_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
