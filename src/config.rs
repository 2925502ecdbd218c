use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::memory::retention::RetentionPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HindsightConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub vector: VectorConfig,
    pub provider: ProviderConfig,
    pub sessions: SessionConfig,
    pub context: ContextConfig,
    pub retention: RetentionPolicy,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Bearer token required from non-loopback clients. `None` rejects them outright.
    pub auth_token: Option<String>,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Empty means `<data_dir>/hindsight.db`.
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorConfig {
    /// `sqlite-vec` or `none`.
    pub backend: String,
    /// `local` (ONNX) or `command` (external embedding process).
    pub embedding: String,
    pub model: String,
    pub cache_dir: String,
    /// argv of the external embedding process when `embedding = "command"`.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_processes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub primary: ProviderEndpoint,
    pub fallback: Option<ProviderEndpoint>,
    pub request_timeout_secs: u64,
    pub max_consecutive_restarts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderEndpoint {
    /// `anthropic` or `openai-compatible`.
    pub kind: String,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub stale_after_mins: u64,
    pub history_limit: usize,
    pub skip_tools: Vec<String>,
    pub observation_types: Vec<String>,
    pub shutdown_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub observation_count: usize,
    pub summary_count: usize,
    pub token_budget: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub poll_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub step_timeout_ms: u64,
    pub session_stop_timeout_ms: u64,
    pub child_exit_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 37777,
            log_level: "info".into(),
            auth_token: None,
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 300,
            window_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_hindsight_dir().to_string_lossy().into_owned(),
            db_path: String::new(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        let cache_dir = default_hindsight_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            backend: "sqlite-vec".into(),
            embedding: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            command: Vec::new(),
            timeout_secs: 30,
            max_processes: 2,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            primary: ProviderEndpoint::default(),
            fallback: None,
            request_timeout_secs: 120,
            max_consecutive_restarts: 3,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl Default for ProviderEndpoint {
    fn default() -> Self {
        Self {
            kind: "anthropic".into(),
            model: "claude-haiku-4-5".into(),
            base_url: "https://api.anthropic.com".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            max_tokens: 4096,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_after_mins: 30,
            history_limit: 40,
            skip_tools: vec![
                "ListMcpResourcesTool".into(),
                "SlashCommand".into(),
                "Skill".into(),
                "TodoWrite".into(),
                "AskUserQuestion".into(),
            ],
            observation_types: vec![
                "discovery".into(),
                "bugfix".into(),
                "feature".into(),
                "refactor".into(),
                "change".into(),
                "decision".into(),
            ],
            shutdown_timeout_secs: 10,
            maintenance_interval_secs: 300,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            observation_count: 50,
            summary_count: 10,
            token_budget: 4000,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            health_timeout_ms: 30_000,
            step_timeout_ms: 5_000,
            session_stop_timeout_ms: 10_000,
            child_exit_timeout_ms: 5_000,
        }
    }
}

/// Returns `~/.hindsight/`, or `./.hindsight` when no home directory is known.
pub fn default_hindsight_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hindsight")
}

/// Returns the default config file path: `~/.hindsight/config.toml`
pub fn default_config_path() -> PathBuf {
    default_hindsight_dir().join("config.toml")
}

impl HindsightConfig {
    /// Load config from the default TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            HindsightConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HINDSIGHT_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("HINDSIGHT_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("HINDSIGHT_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("HINDSIGHT_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid HINDSIGHT_PORT"),
            }
        }
        if let Ok(val) = std::env::var("HINDSIGHT_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("HINDSIGHT_AUTH_TOKEN") {
            if !val.is_empty() {
                self.server.auth_token = Some(val);
            }
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.storage.db_path.is_empty() {
            self.data_dir().join("hindsight.db")
        } else {
            expand_tilde(&self.storage.db_path)
        }
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir().join("worker.pid")
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.server.host, self.server.port)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HindsightConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 37777);
        assert_eq!(config.provider.max_consecutive_restarts, 3);
        assert!(config.resolved_db_path().ends_with("hindsight.db"));
        assert!(config.provider.fallback.is_none());
        assert!(!config.retention.enabled);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
port = 40000

[storage]
db_path = "/tmp/test.db"

[vector]
backend = "none"

[provider.fallback]
kind = "openai-compatible"
model = "mistral-small"
base_url = "https://openrouter.ai/api/v1"
api_key_env = "OPENROUTER_API_KEY"

[retention]
enabled = true
max_age_days = 30
"#;
        let config: HindsightConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.port, 40000);
        assert_eq!(config.resolved_db_path(), PathBuf::from("/tmp/test.db"));
        assert_eq!(config.vector.backend, "none");
        let fallback = config.provider.fallback.unwrap();
        assert_eq!(fallback.kind, "openai-compatible");
        assert_eq!(fallback.max_tokens, 4096);
        assert!(config.retention.enabled);
        assert_eq!(config.retention.max_age_days, Some(30));
        // defaults still apply for unset fields
        assert_eq!(config.sessions.history_limit, 40);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = HindsightConfig::default();
        std::env::set_var("HINDSIGHT_DB", "/tmp/override.db");
        std::env::set_var("HINDSIGHT_PORT", "41000");
        std::env::set_var("HINDSIGHT_AUTH_TOKEN", "secret");

        config.apply_env_overrides();

        assert_eq!(config.resolved_db_path(), PathBuf::from("/tmp/override.db"));
        assert_eq!(config.server.port, 41000);
        assert_eq!(config.server.auth_token.as_deref(), Some("secret"));

        std::env::remove_var("HINDSIGHT_DB");
        std::env::remove_var("HINDSIGHT_PORT");
        std::env::remove_var("HINDSIGHT_AUTH_TOKEN");
    }
}
