use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::ContextValue;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not find home directory")]
    NoHomeDir,

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollabConfig {
    pub ollama: OllamaConfig,
    pub github: GitHubConfig,
    pub context: ContextConfig,
    pub agent: AgentConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OllamaConfig {
    pub base_url: String,
    pub default_model: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitHubConfig {
    pub binary: String,
    pub default_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    pub max_history_size: usize,
    #[serde(default)]
    pub autosave_path: Option<PathBuf>,
    pub autosave_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Longest single backoff delay.
    pub const MAX_DELAY: Duration = Duration::from_secs(60);

    /// Delay before retry number `attempt` (zero-based), capped at
    /// [`Self::MAX_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = Duration::from_millis(self.initial_delay_ms).as_secs_f64()
            * self.backoff_factor.powi(exponent);
        if secs.is_nan() {
            return Self::MAX_DELAY;
        }
        Duration::try_from_secs_f64(secs)
            .map(|d| d.min(Self::MAX_DELAY))
            .unwrap_or(Self::MAX_DELAY)
    }
}

/// Per-agent settings, replaceable at runtime through `Agent::initialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfiguration {
    /// Maximum task starts per minute.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default)]
    pub model: Option<String>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub additional_parameters: HashMap<String, ContextValue>,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            rate_limit: None,
            max_tokens: 2000,
            temperature: 0.7,
            model: None,
            timeout_secs: 120,
            retry: RetryPolicy::default(),
            additional_parameters: HashMap::new(),
        }
    }
}

impl AgentConfiguration {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout must be positive".to_string()));
        }
        let factor = self.retry.backoff_factor;
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "backoff factor {} must be finite and at least 1",
                factor
            )));
        }
        if Duration::from_millis(self.retry.initial_delay_ms) > RetryPolicy::MAX_DELAY {
            return Err(ConfigError::Invalid(format!(
                "initial retry delay {}ms exceeds {:?}",
                self.retry.initial_delay_ms,
                RetryPolicy::MAX_DELAY
            )));
        }
        if self.rate_limit == Some(0) {
            return Err(ConfigError::Invalid("rate limit must be positive".to_string()));
        }
        Ok(())
    }

    /// Minimum spacing between task starts implied by `rate_limit`.
    pub fn min_interval(&self) -> Option<Duration> {
        self.rate_limit
            .filter(|r| *r > 0)
            .map(|r| Duration::from_secs(60) / r)
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            ollama: OllamaConfig {
                base_url: "http://localhost:11434".to_string(),
                default_model: Some("llama3.1".to_string()),
                request_timeout_secs: 300,
            },
            github: GitHubConfig {
                binary: "gh".to_string(),
                default_limit: 30,
            },
            context: ContextConfig {
                max_history_size: 100,
                autosave_path: None,
                autosave_interval_secs: 60,
            },
            agent: AgentConfiguration::default(),
        }
    }
}

impl CollabConfig {
    /// Load from the default location, writing a default file if none exists.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let default_config = Self::default();
            default_config.save_to(&config_path)?;
            Ok(default_config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.agent.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn config_file_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".config").join("collab").join("config.toml"))
    }

    /// Agent configuration with the Ollama default model filled in when the
    /// agent section does not name one.
    pub fn agent_configuration(&self) -> AgentConfiguration {
        let mut agent = self.agent.clone();
        if agent.model.is_none() {
            agent.model = self.ollama.default_model.clone();
        }
        agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CollabConfig::default();
        config.context.max_history_size = 7;
        config.agent.rate_limit = Some(30);
        config
            .agent
            .additional_parameters
            .insert("top_p".to_string(), ContextValue::Number(0.9));
        config.save_to(&path).unwrap();

        let loaded = CollabConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_agent_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = CollabConfig::default();
        config.agent.temperature = 3.5;
        config.save_to(&path).unwrap();

        assert!(matches!(CollabConfig::load_from(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_factor: 1e300,
        };
        assert_eq!(policy.delay_for(1), RetryPolicy::MAX_DELAY);
        assert_eq!(policy.delay_for(3), RetryPolicy::MAX_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), RetryPolicy::MAX_DELAY);

        let nan = RetryPolicy {
            backoff_factor: f64::NAN,
            ..policy
        };
        assert_eq!(nan.delay_for(2), RetryPolicy::MAX_DELAY);
    }

    #[test]
    fn test_validation() {
        let mut config = AgentConfiguration::default();
        assert!(config.validate().is_ok());

        config.timeout_secs = 0;
        assert!(config.validate().is_err());

        config = AgentConfiguration::default();
        config.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        config.retry.backoff_factor = f64::NAN;
        assert!(config.validate().is_err());

        config.retry.backoff_factor = f64::INFINITY;
        assert!(config.validate().is_err());

        config = AgentConfiguration::default();
        config.retry.initial_delay_ms = u64::MAX;
        assert!(config.validate().is_err());

        config = AgentConfiguration {
            rate_limit: Some(120),
            ..AgentConfiguration::default()
        };
        assert_eq!(config.min_interval(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_agent_configuration_inherits_default_model() {
        let config = CollabConfig::default();
        assert_eq!(config.agent_configuration().model.as_deref(), Some("llama3.1"));
    }
}
