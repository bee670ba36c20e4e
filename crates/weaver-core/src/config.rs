use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaverError};

/// Top-level Weaver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Limits applied by the workflow runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum nodes of one execution running at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Deadline for a whole execution, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Deadline for a single executor call, in seconds.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_timeout_secs(),
            node_timeout_secs: default_node_timeout_secs(),
        }
    }
}

fn default_max_concurrency() -> usize {
    3
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_node_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

/// SQLite persistence for workflow definitions and finished executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Directory for per-execution JSONL run logs. Disabled when unset.
    #[serde(default)]
    pub run_log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            run_log_dir: None,
        }
    }
}

fn default_log_filter() -> String {
    "weaver=info,warn".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaverError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeaverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(WeaverError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.engine.timeout_secs == 0 || self.engine.node_timeout_secs == 0 {
            return Err(WeaverError::Config("engine timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store.as_ref().map(|s| expand_home(&s.path))
    }

    /// Resolve the run log directory (expand ~).
    pub fn run_log_dir(&self) -> Option<PathBuf> {
        self.log.run_log_dir.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
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
