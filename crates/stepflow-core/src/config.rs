use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepflowError};

/// Top-level stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub defaults: NodeDefaults,
    #[serde(default)]
    pub events: EventsConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

/// Settings for the workflow driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Fixed workflow id. Default: derived from the pipeline name.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Session to hydrate at run start and persist at run end.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Stream agent output as `step_output` events (default: false).
    #[serde(default)]
    pub stream: bool,
    /// Capacity of the per-step chunk channel when streaming.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            session_id: None,
            stream: false,
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_stream_buffer() -> usize { 64 }

/// Defaults applied to nodes that do not set their own policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefaults {
    #[serde(default)]
    pub max_retries: u32,
    /// Backoff unit between attempts: attempt N sleeps N x this.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Per-step timeout. None = no timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Hard ceiling for loops.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Width of the parallel worker pool. None = unlimited.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: None,
            max_iterations: default_max_iterations(),
            max_concurrency: None,
        }
    }
}

impl NodeDefaults {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_backoff_base_ms() -> u64 { 1000 }
fn default_max_iterations() -> usize { 10 }

/// Event delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Emit lifecycle events (default: true).
    #[serde(default = "default_events_enabled")]
    pub enabled: bool,
    /// Broadcast channel capacity.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: default_events_enabled(),
            capacity: default_event_capacity(),
        }
    }
}

fn default_events_enabled() -> bool { true }
fn default_event_capacity() -> usize { 256 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.stepflow/logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Logging level: 1 = workflow events, 2 = + step events, 3 = everything (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: 2,
        }
    }
}

impl LogConfig {
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.stepflow/logs".to_string() }
fn default_log_level() -> u8 { 2 }

/// Session storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database path for the sqlite backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

impl StorageConfig {
    pub fn path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_storage_path() -> String { "~/.stepflow/sessions.db".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
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

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
