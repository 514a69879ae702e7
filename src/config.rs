//! Agent configuration
//!
//! One TOML file per agent process. The `[agent]` and `[broker]` sections are
//! required; everything else has defaults. Secrets are never stored in the
//! file, only the names of the environment variables holding them.

use crate::pipeline::{PipelineSettings, Stage, StageSpec};
use crate::protocol::{validate_agent_id, AgentIdentity};
use crate::session::ReconnectPolicy;
use crate::specialist::SpecialistRole;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Locations searched when no `--config` is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["agent.toml", "config/agent.toml"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Present only in specialist processes
    pub specialist: Option<SpecialistSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Display name; defaults to the id
    pub name: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `mqtt://host:port`, `mqtts://host:port` or `memory://`
    pub url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Agents that must be connected before a session starts
    #[serde(default)]
    pub wait_for_agents: usize,
    #[serde(default = "default_wait_for_agents_timeout")]
    pub wait_for_agents_timeout_secs: u64,
}

fn default_wait_for_agents_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    #[serde(default)]
    pub checkout: StageSection,
    #[serde(default)]
    pub diff_review: StageSection,
    #[serde(default)]
    pub test_execution: StageSection,
}

/// Overrides for one stage; unset fields keep the stage default
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSection {
    pub agent_id: Option<String>,
    pub timeout_ms: Option<u64>,
    pub wait_attempts: Option<u32>,
    pub send_attempts: Option<u32>,
}

impl StageSection {
    fn apply(&self, spec: &mut StageSpec) {
        if let Some(agent_id) = &self.agent_id {
            spec.agent_id = agent_id.clone();
        }
        if let Some(ms) = self.timeout_ms {
            spec.policy.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.wait_attempts {
            spec.policy.wait_attempts = n;
        }
        if let Some(n) = self.send_attempts {
            spec.policy.send_attempts = n;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistSection {
    pub role: SpecialistRole,
    #[serde(default = "default_coordinator")]
    pub coordinator_id: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// Extra settings passed to the role's tool
    pub tool: Option<serde_json::Value>,
}

fn default_coordinator() -> String {
    "user_interaction_agent".to_string()
}

fn default_poll_timeout() -> u64 {
    30_000
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".")
}

impl SpecialistSection {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Tool settings with `workspace_dir` filled in
    pub fn tool_config(&self) -> serde_json::Value {
        let mut config = match &self.tool {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        config
            .entry("workspace_dir")
            .or_insert_with(|| self.workspace_dir.to_string_lossy().into_owned().into());
        serde_json::Value::Object(config)
    }
}

/// Scheme of the configured broker URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Memory,
    Mqtt,
    Mqtts,
}

impl BrokerScheme {
    /// Scheme of `url` (pure function)
    pub fn of(url: &str) -> Result<Self, ConfigError> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(url.to_string()))?;

        match scheme.as_str() {
            "memory" => Ok(BrokerScheme::Memory),
            "mqtt" | "tcp" => Ok(BrokerScheme::Mqtt),
            "mqtts" | "ssl" => Ok(BrokerScheme::Mqtts),
            _ => Err(ConfigError::InvalidBrokerUrl(url.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("No config file found (looked for {0})")]
    NotFound(String),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Unsupported broker URL '{0}' (expected mqtt://, mqtts:// or memory://)")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// First existing default config location
    pub fn find_default_file() -> Result<PathBuf, ConfigError> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
            .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_agent_id(&self.agent.id)?;
        BrokerScheme::of(&self.broker.url)?;

        self.reconnect_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        let settings = self.pipeline_settings();
        for stage in Stage::ALL {
            let spec = settings.stage(stage);
            check_agent_id(&spec.agent_id)?;
            if spec.policy.timeout.is_zero()
                || spec.policy.wait_attempts == 0
                || spec.policy.send_attempts == 0
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "[pipeline.{}] timeout and attempt counts must be greater than 0",
                    stage.label()
                )));
            }
        }

        if let Some(specialist) = &self.specialist {
            check_agent_id(&specialist.coordinator_id)?;
            if specialist.poll_timeout_ms == 0 {
                return Err(ConfigError::InvalidConfig(
                    "[specialist] poll_timeout_ms must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity::new(
            self.agent.id.clone(),
            self.agent.name.clone().unwrap_or_else(|| self.agent.id.clone()),
            self.agent.description.clone(),
        )
    }

    pub fn broker_scheme(&self) -> Result<BrokerScheme, ConfigError> {
        BrokerScheme::of(&self.broker.url)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.session.max_retries,
            Duration::from_secs(self.session.retry_delay_secs),
        )
    }

    /// Stage defaults with this file's overrides applied
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        self.pipeline.checkout.apply(&mut settings.checkout);
        self.pipeline.diff_review.apply(&mut settings.diff_review);
        self.pipeline.test_execution.apply(&mut settings.test_execution);
        settings
    }

    pub fn wait_for_agents_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.wait_for_agents_timeout_secs)
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    pub fn get_broker_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    pub fn get_broker_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Configuration used by the in-process demo
    pub fn demo() -> Self {
        Self {
            agent: AgentSection {
                id: "user_interaction_agent".to_string(),
                name: Some("User Interaction Agent".to_string()),
                description: "Handles user instructions and coordinates testing tasks."
                    .to_string(),
            },
            broker: BrokerSection {
                url: "memory://".to_string(),
                username_env: None,
                password_env: None,
                wait_for_agents: 4,
                wait_for_agents_timeout_secs: default_wait_for_agents_timeout(),
            },
            session: SessionSection::default(),
            pipeline: PipelineSection::default(),
            specialist: None,
        }
    }
}

fn check_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    validate_agent_id(agent_id).map_err(|e| {
        ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+ ({e})"
        ))
    })
}
