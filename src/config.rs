use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Configuration for process execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Timeout applied when neither the action nor the tool sets one (default: 300)
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Maximum bytes captured per stream before truncation (default: 1MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Grace period between SIGTERM and SIGKILL when terminating a process
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Working directory for spawned tools (defaults to the current directory)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    1_048_576 // 1MB
}

fn default_kill_grace_ms() -> u64 {
    2000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
            working_dir: None,
        }
    }
}

/// Where tool descriptors come from at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Register the packaged descriptors and custom bindings (default: true)
    #[serde(default = "default_true")]
    pub include_builtin: bool,

    /// Directories scanned for `*.json` tool descriptors
    #[serde(default)]
    pub descriptor_dirs: Vec<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            include_builtin: true,
            descriptor_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum characters of tool output quoted in a history summary (default: 8000)
    #[serde(default = "default_history_output_chars")]
    pub history_output_chars: usize,

    /// Inject parse warnings into the history so the model can self-correct
    #[serde(default = "default_true")]
    pub surface_parse_warnings: bool,
}

fn default_history_output_chars() -> usize {
    8000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_output_chars: default_history_output_chars(),
            surface_parse_warnings: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file for saved sessions
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("ai-ops").join("config.toml"))
    }

    /// Resolved path of the session database
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.storage.database_path {
            return Ok(path.clone());
        }
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("ai-ops").join("sessions.db"))
    }
}
