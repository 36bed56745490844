//! Configuration management for toolchat.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Name of the project-level configuration file
pub const CONFIG_FILE_NAME: &str = "toolchat.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Language model endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_model_api_key_env")]
    pub api_key_env: String,
    /// Model used when none is selected explicitly
    #[serde(default = "default_model_name")]
    pub default_model: String,
    /// Upper bound on generate/tool steps per turn
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Replaces the built-in system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Timeout for a single handshake + catalog attempt
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

/// Remote sandbox service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Sandbox service API root; provisioning is disabled when unset
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_sandbox_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    /// Bound on sandbox API calls and the package install step
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    /// 0 keeps the sandbox running until it is deleted
    #[serde(default)]
    pub auto_stop_minutes: u32,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the persisted registry; defaults to the platform data dir
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_model_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model_name() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_max_steps() -> usize {
    20
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_sandbox_api_key_env() -> String {
    "SANDBOX_API_KEY".to_string()
}

fn default_cpu() -> u32 {
    2
}

fn default_memory_gb() -> u32 {
    4
}

fn default_disk_gb() -> u32 {
    5
}

fn default_sandbox_timeout() -> u64 {
    300
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_token_header() -> String {
    "x-sandbox-preview-token".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_base_url(),
            api_key_env: default_model_api_key_env(),
            default_model: default_model_name(),
            max_steps: default_max_steps(),
            system_prompt: None,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key_env: default_sandbox_api_key_env(),
            cpu: default_cpu(),
            memory_gb: default_memory_gb(),
            disk_gb: default_disk_gb(),
            timeout_secs: default_sandbox_timeout(),
            auto_stop_minutes: 0,
            gateway_port: default_gateway_port(),
            token_header: default_token_header(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

impl ModelConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

impl StorageConfig {
    /// Resolve the storage directory
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("toolchat"))
            .context("Could not determine data directory")
    }
}

impl Config {
    /// Load configuration, falling back to defaults when no file exists
    pub fn load() -> Result<Self> {
        match Self::find_config_path() {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Find toolchat.toml in the current directory and parents, then the user config dir
    pub fn find_config_path() -> Option<PathBuf> {
        if let Ok(mut current) = std::env::current_dir() {
            for _ in 0..10 {
                let candidate = current.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    return Some(candidate);
                }
                if !current.pop() {
                    break;
                }
            }
        }

        dirs::config_dir()
            .map(|d| d.join("toolchat").join("config.toml"))
            .filter(|p| p.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[model]
base_url = "http://localhost:11434/v1"
default_model = "qwen2.5"
max_steps = 8

[probe]
timeout_secs = 3

[retry]
max_attempts = 10
max_delay_ms = 4000

[sandbox]
api_url = "https://sandbox.example.com/api"
memory_gb = 8
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.model.default_model, "qwen2.5");
        assert_eq!(config.model.max_steps, 8);
        assert_eq!(config.model.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.probe.timeout(), Duration::from_secs(3));
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.initial_delay_ms, 500);
        assert_eq!(config.sandbox.memory_gb, 8);
        assert_eq!(config.sandbox.cpu, 2);
        assert_eq!(config.sandbox.gateway_port, 3000);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.model.max_steps, 20);
        assert_eq!(config.probe.timeout_secs, 5);
        assert_eq!(config.retry.max_attempts, 20);
        assert!(config.sandbox.api_url.is_none());
        assert_eq!(config.sandbox.token_header, "x-sandbox-preview-token");
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("toolchat-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[storage]\ndir = \"/tmp/toolchat-store\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(
            config.storage.resolve_dir().unwrap(),
            PathBuf::from("/tmp/toolchat-store")
        );

        std::fs::remove_dir_all(&dir).ok();
    }
}
