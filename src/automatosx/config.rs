//! Top-level configuration and the injected environment record.
//!
//! The config file (`automatosx.config.json`) is deserialized into
//! [`AutomatosXConfig`]; every field carries a serde default so a partial
//! file works. [`AutomatosXConfig::validate`] enforces the documented
//! bounds and is called once at startup, before any manager is built.
//!
//! Ambient process state (current working directory, environment
//! variables) is never consulted after startup: the [`Environment`]
//! record is captured once and injected into every component that needs
//! project paths. Tests construct it explicitly against a temp dir.
//!
//! # Example
//!
//! ```rust
//! use automatosx::config::{AutomatosXConfig, Environment};
//!
//! let env = Environment::new("/tmp/demo-project");
//! assert!(env.agents_dir().ends_with(".automatosx/agents"));
//!
//! let config = AutomatosXConfig::default();
//! // The default config carries no providers, which is invalid:
//! assert!(config.validate().is_err());
//! ```

use crate::automatosx::memory::MemoryCleanupConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// Configuration error with a machine-readable code.
#[derive(Debug)]
pub struct ConfigError {
    /// Human-readable description of the violation.
    pub message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        "ConfigError"
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid configuration: {}", self.message)
    }
}

impl Error for ConfigError {}

/// Project environment captured once at startup.
///
/// All filesystem discovery goes through this record; nothing in the core
/// reads the process working directory after construction.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Root of the project the CLI operates on.
    pub project_dir: PathBuf,
}

impl Environment {
    /// Capture an environment rooted at the given project directory.
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    /// `<project>/.automatosx`
    pub fn automatosx_dir(&self) -> PathBuf {
        self.project_dir.join(".automatosx")
    }

    /// `<project>/automatosx.config.json`
    pub fn config_path(&self) -> PathBuf {
        self.project_dir.join("automatosx.config.json")
    }

    /// `<project>/.automatosx/agents`
    pub fn agents_dir(&self) -> PathBuf {
        self.automatosx_dir().join("agents")
    }

    /// `<project>/.automatosx/abilities`
    pub fn abilities_dir(&self) -> PathBuf {
        self.automatosx_dir().join("abilities")
    }

    /// `<project>/.automatosx/teams`
    pub fn teams_dir(&self) -> PathBuf {
        self.automatosx_dir().join("teams")
    }

    /// `<project>/.automatosx/templates`
    pub fn templates_dir(&self) -> PathBuf {
        self.automatosx_dir().join("templates")
    }

    /// `<project>/.automatosx/memory/memory.db`
    pub fn memory_db_path(&self) -> PathBuf {
        self.automatosx_dir().join("memory").join("memory.db")
    }

    /// `<project>/.automatosx/sessions/sessions.json`
    pub fn sessions_path(&self) -> PathBuf {
        self.automatosx_dir().join("sessions").join("sessions.json")
    }

    /// `<project>/.automatosx/checkpoints`
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.automatosx_dir().join("checkpoints")
    }

    /// `<project>/.automatosx/workspaces`
    pub fn workspaces_dir(&self) -> PathBuf {
        self.automatosx_dir().join("workspaces")
    }

    /// `<project>/.automatosx/logs`
    pub fn logs_dir(&self) -> PathBuf {
        self.automatosx_dir().join("logs")
    }
}

/// One provider entry under `providers.<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    /// Disabled providers are never registered with the router.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Selection priority; lower is preferred.
    #[serde(default)]
    pub priority: u32,
    /// Per-call timeout in milliseconds. Must be at least 1000.
    #[serde(default = "default_provider_timeout")]
    pub timeout: u64,
    /// Adapter command line (subprocess providers) or endpoint tag.
    #[serde(default)]
    pub command: String,
}

/// The `memory` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySection {
    /// Hard cap on stored entries. Must be at least 100.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Database path relative to the project root.
    #[serde(default = "default_memory_path")]
    pub persist_path: String,
    /// Whether retention cleanup runs automatically.
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    /// Retention window in days for automatic cleanup. Must be ≥ 1.
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u32,
    /// Smart-cleanup policy applied on insert pressure.
    #[serde(default)]
    pub cleanup: MemoryCleanupConfig,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            persist_path: default_memory_path(),
            auto_cleanup: true,
            cleanup_days: default_cleanup_days(),
            cleanup: MemoryCleanupConfig::default(),
        }
    }
}

/// The `workspace` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSection {
    /// Shared PRD directory, relative to the project root.
    #[serde(default = "default_prd_path")]
    pub prd_path: String,
    /// Shared temp directory, relative to the project root.
    #[serde(default = "default_tmp_path")]
    pub tmp_path: String,
    /// Whether temp files are cleaned automatically.
    #[serde(default = "default_true")]
    pub auto_cleanup_tmp: bool,
    /// Age threshold in days for temp cleanup. Must be ≥ 1.
    #[serde(default = "default_tmp_cleanup_days")]
    pub tmp_cleanup_days: u32,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            prd_path: default_prd_path(),
            tmp_path: default_tmp_path(),
            auto_cleanup_tmp: true,
            tmp_cleanup_days: default_tmp_cleanup_days(),
        }
    }
}

/// Log verbosity names accepted in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map to the `log` crate's filter.
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// The `logging` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Optional log file path, relative to the project root.
    #[serde(default)]
    pub path: Option<String>,
    /// Whether log lines also go to stderr.
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
            console: true,
        }
    }
}

/// Retry defaults under `execution.defaultRetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first. `1` disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Case-insensitive substrings matched against message + code.
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

/// The `execution` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSection {
    /// Upper bound on concurrently running delegations. Must be ≥ 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_agents: usize,
    #[serde(default)]
    pub default_retry: RetryConfig,
    /// Optional default timeout for agent runs, in milliseconds.
    #[serde(default)]
    pub default_timeout: Option<u64>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent(),
            default_retry: RetryConfig::default(),
            default_timeout: None,
        }
    }
}

/// Router tuning under the optional `router` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSection {
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    #[serde(default = "default_cooldown_ms")]
    pub provider_cooldown_ms: u64,
    /// `0` disables the background health loop.
    #[serde(default)]
    pub health_check_interval_ms: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            provider_cooldown_ms: default_cooldown_ms(),
            health_check_interval_ms: 0,
        }
    }
}

/// The whole `automatosx.config.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatosXConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub router: RouterSection,
}

impl AutomatosXConfig {
    /// Load and validate a config file.
    ///
    /// A missing file yields the defaults plus the validation failure for
    /// having zero enabled providers, so callers see one consistent error
    /// path for an unconfigured project.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::new(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| ConfigError::new(format!("cannot parse {}: {}", path.display(), e)))?
        } else {
            log::warn!("Config file {} not found; using defaults", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Enforce the documented bounds on every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.providers.values().any(|p| p.enabled) {
            return Err(ConfigError::new(
                "at least one enabled provider is required",
            ));
        }
        for (name, provider) in &self.providers {
            if provider.timeout < 1000 {
                return Err(ConfigError::new(format!(
                    "providers.{}.timeout must be at least 1000 ms",
                    name
                )));
            }
        }
        if self.memory.max_entries < 100 {
            return Err(ConfigError::new("memory.maxEntries must be at least 100"));
        }
        if self.memory.cleanup_days < 1 {
            return Err(ConfigError::new("memory.cleanupDays must be at least 1"));
        }
        self.memory
            .cleanup
            .validate()
            .map_err(|e| ConfigError::new(e.to_string()))?;
        if self.workspace.tmp_cleanup_days < 1 {
            return Err(ConfigError::new(
                "workspace.tmpCleanupDays must be at least 1",
            ));
        }
        if self.execution.max_concurrent_agents < 1 {
            return Err(ConfigError::new(
                "execution.maxConcurrentAgents must be at least 1",
            ));
        }
        if self.execution.default_timeout == Some(0) {
            return Err(ConfigError::new("execution.defaultTimeout must be positive"));
        }
        if self.execution.default_retry.max_attempts < 1 {
            return Err(ConfigError::new(
                "execution.defaultRetry.maxAttempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Enabled providers in priority order (name, entry).
    pub fn enabled_providers(&self) -> Vec<(&String, &ProviderEntry)> {
        let mut providers: Vec<_> = self.providers.iter().filter(|(_, p)| p.enabled).collect();
        providers.sort_by_key(|(_, p)| p.priority);
        providers
    }
}

fn default_true() -> bool {
    true
}

fn default_provider_timeout() -> u64 {
    120_000
}

fn default_max_entries() -> usize {
    10_000
}

fn default_memory_path() -> String {
    ".automatosx/memory/memory.db".to_string()
}

fn default_cleanup_days() -> u32 {
    30
}

fn default_prd_path() -> String {
    ".automatosx/PRD".to_string()
}

fn default_tmp_path() -> String {
    ".automatosx/tmp".to_string()
}

fn default_tmp_cleanup_days() -> u32 {
    7
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retryable_errors() -> Vec<String> {
    [
        "ECONNREFUSED",
        "ETIMEDOUT",
        "ENOTFOUND",
        "rate_limit",
        "overloaded",
        "timeout",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_cooldown_ms() -> u64 {
    60_000
}
