use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// User settings forwarded to servers via `workspace/didChangeConfiguration`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
}

/// How to launch the language server and which documents it cares about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Command to start the server
    pub command: String,
    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Language ids handled by the server
    #[serde(default)]
    pub language_ids: Vec<String>,
    /// File extensions handled by the server (used when a buffer has no language id)
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Files whose presence marks a project root
    #[serde(default = "default_root_markers")]
    pub root_markers: Vec<String>,
    /// Initialization options to pass to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<serde_json::Value>,
}

fn default_root_markers() -> Vec<String> {
    vec![".git".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "typescript-language-server".to_string(),
            args: vec!["--stdio".to_string()],
            env: HashMap::new(),
            language_ids: vec![
                "javascript".to_string(),
                "javascriptreact".to_string(),
                "typescript".to_string(),
                "typescriptreact".to_string(),
            ],
            extensions: vec![
                "js".to_string(),
                "jsx".to_string(),
                "mjs".to_string(),
                "cjs".to_string(),
                "ts".to_string(),
                "tsx".to_string(),
            ],
            root_markers: vec![
                "package.json".to_string(),
                "tsconfig.json".to_string(),
                "jsconfig.json".to_string(),
                ".git".to_string(),
            ],
            initialization_options: None,
        }
    }
}

impl ServerConfig {
    /// Whether a document with this language id / path should be handled
    pub fn matches(&self, language_id: Option<&str>, path: Option<&Path>) -> bool {
        if let Some(language_id) = language_id {
            return self.language_ids.iter().any(|id| id == language_id);
        }

        path.and_then(|p| p.extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }
}

/// Start/stop/restart policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Unexpected closes tolerated per project root before giving up (default: 5)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// How long to wait for a server to exit after `exit` before killing it
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Timeout for ordinary requests
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_restarts() -> u32 {
    5
}

fn default_shutdown_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Document synchronization behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on how long a save waits for `willSaveWaitUntil` edits
    #[serde(default = "default_will_save_timeout_ms")]
    pub will_save_wait_until_timeout_ms: u64,

    /// Set when the host already reports file renames to servers itself
    #[serde(default)]
    pub host_reports_file_renames: bool,
}

fn default_will_save_timeout_ms() -> u64 {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            will_save_wait_until_timeout_ms: default_will_save_timeout_ms(),
            host_reports_file_renames: false,
        }
    }
}

impl SyncConfig {
    pub fn will_save_wait_until_timeout(&self) -> Duration {
        Duration::from_millis(self.will_save_wait_until_timeout_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("langbridge").join("config.toml"))
    }
}
