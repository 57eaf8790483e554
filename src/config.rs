//! Configuration management for llamachat
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{LlamachatError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System prompt used when neither the config nor a folder overrides it
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant who speaks professionally without emoticons.";

/// Context length used when the config does not specify one
pub const DEFAULT_CONTEXT_LENGTH: usize = 4096;

/// Main configuration structure for llamachat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Inference backend configuration (local or remote llama.cpp server)
    #[serde(default)]
    pub backend: BackendConfig,
    /// Agent behavior configuration
    #[serde(default)]
    pub agent: AgentConfig,
    /// Turn orchestration timing
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Conversation database settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Backend configuration
///
/// Selects between a server started next to the app (`local`) and a
/// server reachable over the network (`remote`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Type of backend to use
    #[serde(rename = "type", default = "default_backend_type")]
    pub backend_type: String,

    /// Local server configuration
    #[serde(default)]
    pub local: LocalServerConfig,

    /// Remote server configuration
    #[serde(default)]
    pub remote: RemoteServerConfig,

    /// Per-request timeout while waiting for the next streamed chunk (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_backend_type() -> String {
    "local".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: default_backend_type(),
            local: LocalServerConfig::default(),
            remote: RemoteServerConfig::default(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl BackendConfig {
    /// Chunk timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Local llama.cpp server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalServerConfig {
    /// Interface the local server listens on
    #[serde(default = "default_local_host")]
    pub host: String,

    /// Port the local server listens on
    #[serde(default = "default_local_port")]
    pub port: u16,

    /// Model file the local server was started with
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    8690
}

impl Default for LocalServerConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_local_port(),
            model_path: None,
        }
    }
}

/// Remote llama.cpp server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    /// Server host name
    #[serde(default = "default_remote_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_remote_port")]
    pub port: u16,

    /// Use https
    #[serde(default)]
    pub tls: bool,
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

fn default_remote_port() -> u16 {
    8080
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            host: default_remote_host(),
            port: default_remote_port(),
            tls: false,
        }
    }
}

/// Agent behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Speaker identity of the agent in the running prompt and transcript
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// System prompt seeded at the top of the running prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Context length requested from the server
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Sampling temperature override; the server default applies when unset
    #[serde(default)]
    pub temperature: Option<f64>,
}

fn default_agent_id() -> String {
    "Llama".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_context_length() -> usize {
    DEFAULT_CONTEXT_LENGTH
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            system_prompt: default_system_prompt(),
            context_length: default_context_length(),
            temperature: None,
        }
    }
}

/// Turn orchestration timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay before an empty reply placeholder becomes visible (milliseconds)
    #[serde(default = "default_reveal_delay")]
    pub reveal_delay_ms: u64,

    /// Wait between an interrupt and the next submission attempt (milliseconds)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Interrupt attempts before a submission gives up
    #[serde(default = "default_max_interrupt_retries")]
    pub max_interrupt_retries: u32,
}

fn default_reveal_delay() -> u64 {
    600
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_max_interrupt_retries() -> u32 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reveal_delay_ms: default_reveal_delay(),
            retry_backoff_ms: default_retry_backoff(),
            max_interrupt_retries: default_max_interrupt_retries(),
        }
    }
}

impl OrchestratorConfig {
    /// Placeholder reveal delay as a `Duration`
    pub fn reveal_delay(&self) -> Duration {
        Duration::from_millis(self.reveal_delay_ms)
    }

    /// Retry backoff as a `Duration`
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Conversation database settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; the platform data directory is used when unset
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LlamachatError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| LlamachatError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(backend) = std::env::var("LLAMACHAT_BACKEND") {
            self.backend.backend_type = backend;
        }

        if let Ok(host) = std::env::var("LLAMACHAT_HOST") {
            match self.backend.backend_type.as_str() {
                "remote" => self.backend.remote.host = host,
                _ => self.backend.local.host = host,
            }
        }

        if let Ok(port) = std::env::var("LLAMACHAT_PORT") {
            match port.parse() {
                Ok(value) => match self.backend.backend_type.as_str() {
                    "remote" => self.backend.remote.port = value,
                    _ => self.backend.local.port = value,
                },
                Err(_) => tracing::warn!("Invalid LLAMACHAT_PORT: {}", port),
            }
        }

        if let Ok(tls) = std::env::var("LLAMACHAT_TLS") {
            self.backend.remote.tls = matches!(tls.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(model_path) = std::env::var("LLAMACHAT_MODEL_PATH") {
            self.backend.local.model_path = Some(PathBuf::from(model_path));
        }

        if let Ok(context_length) = std::env::var("LLAMACHAT_CONTEXT_LENGTH") {
            if let Ok(value) = context_length.parse() {
                self.agent.context_length = value;
            } else {
                tracing::warn!("Invalid LLAMACHAT_CONTEXT_LENGTH: {}", context_length);
            }
        }

        if let Ok(temperature) = std::env::var("LLAMACHAT_TEMPERATURE") {
            if let Ok(value) = temperature.parse() {
                self.agent.temperature = Some(value);
            } else {
                tracing::warn!("Invalid LLAMACHAT_TEMPERATURE: {}", temperature);
            }
        }

        if let Ok(system_prompt) = std::env::var("LLAMACHAT_SYSTEM_PROMPT") {
            self.agent.system_prompt = system_prompt;
        }

        if let Ok(db_path) = std::env::var("LLAMACHAT_DB") {
            self.storage.db_path = Some(PathBuf::from(db_path));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        if let Some(db_path) = &cli.db {
            tracing::debug!("Using storage DB override from CLI: {}", db_path);
            self.storage.db_path = Some(PathBuf::from(db_path));
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let valid_backends = ["local", "remote"];
        if !valid_backends.contains(&self.backend.backend_type.as_str()) {
            return Err(LlamachatError::Config(format!(
                "Invalid backend type: {}. Must be one of: {}",
                self.backend.backend_type,
                valid_backends.join(", ")
            ))
            .into());
        }

        if self.backend.backend_type == "remote" && self.backend.remote.host.trim().is_empty() {
            return Err(
                LlamachatError::Config("remote.host cannot be empty".to_string()).into(),
            );
        }

        if self.backend.request_timeout_seconds == 0 {
            return Err(LlamachatError::Config(
                "request_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.agent.id.trim().is_empty() {
            return Err(LlamachatError::Config("agent.id cannot be empty".to_string()).into());
        }

        if self.agent.id == crate::storage::USER_SPEAKER_ID {
            return Err(LlamachatError::Config(format!(
                "agent.id cannot be the reserved speaker id '{}'",
                crate::storage::USER_SPEAKER_ID
            ))
            .into());
        }

        if self.agent.context_length == 0 {
            return Err(LlamachatError::Config(
                "agent.context_length must be greater than 0".to_string(),
            )
            .into());
        }

        if let Some(temperature) = self.agent.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(LlamachatError::Config(
                    "agent.temperature must be between 0.0 and 2.0".to_string(),
                )
                .into());
            }
        }

        if self.orchestrator.max_interrupt_retries == 0 {
            return Err(LlamachatError::Config(
                "orchestrator.max_interrupt_retries must be greater than 0".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            agent: AgentConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}
