use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Top-level Pipewright configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub run_log: RunLogConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Approval poll cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Append a `running` record to the run log when a run starts.
    #[serde(default = "default_record_running_runs")]
    pub record_running_runs: bool,
    #[serde(default = "default_code_timeout_secs")]
    pub default_code_timeout_secs: u64,
    #[serde(default = "default_agent_timeout_secs")]
    pub default_agent_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            record_running_runs: default_record_running_runs(),
            default_code_timeout_secs: default_code_timeout_secs(),
            default_agent_timeout_secs: default_agent_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_poll_interval_ms() -> u64 { 2_000 }
fn default_record_running_runs() -> bool { true }
fn default_code_timeout_secs() -> u64 { 120 }
fn default_agent_timeout_secs() -> u64 { 300 }
fn default_event_capacity() -> usize { 256 }

/// Host gateway reached over JSON-RPC for remote calls and agent turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

fn default_gateway_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLogBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogConfig {
    #[serde(default)]
    pub backend: RunLogBackend,
    #[serde(default = "default_run_log_dir")]
    pub dir: String,
    #[serde(default = "default_max_runs")]
    pub max_runs_per_pipeline: usize,
}

impl Default for RunLogConfig {
    fn default() -> Self {
        Self {
            backend: RunLogBackend::default(),
            dir: default_run_log_dir(),
            max_runs_per_pipeline: default_max_runs(),
        }
    }
}

impl RunLogConfig {
    /// Resolve the run log directory (expand ~).
    pub fn dir_path(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

fn default_run_log_dir() -> String { "~/.pipewright/runs".to_string() }
fn default_max_runs() -> usize { 100 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive. `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "pipewright=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PipelineError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
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

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
