//! Agent routing and daemon configuration, loaded from `.fuel/config.yaml`.

use fuel_core::Complexity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use thiserror::Error;
use tracing::info;

/// Placeholder in agent args replaced by the rendered prompt.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

const DEFAULT_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_CONCURRENT: usize = 1;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_AGENT: &str = "claude";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse YAML file at {path}: {source}")]
    YamlParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Structurally valid YAML describing an unusable setup.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How to launch one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable name or path.
    pub command: String,

    /// Arguments; `{prompt}` is substituted, otherwise the prompt is appended.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub model: Option<String>,

    /// Extra environment for the agent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl AgentConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![PROMPT_PLACEHOLDER.to_string()],
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
            model: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Arguments with the prompt substituted in.
    pub fn render_args(&self, prompt: &str) -> Vec<String> {
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(PROMPT_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(PROMPT_PLACEHOLDER, prompt)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(prompt.to_string());
        }
        args
    }
}

/// Review settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Reviewing agent; falls back to the primary agent.
    #[serde(default)]
    pub agent: Option<String>,
}

/// Complexity-to-agent routing. Unset levels fall back to the primary agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexityRouting {
    pub trivial: Option<String>,
    pub simple: Option<String>,
    pub moderate: Option<String>,
    pub complex: Option<String>,
}

impl ComplexityRouting {
    fn get(&self, complexity: Complexity) -> Option<&String> {
        match complexity {
            Complexity::Trivial => self.trivial.as_ref(),
            Complexity::Simple => self.simple.as_ref(),
            Complexity::Moderate => self.moderate.as_ref(),
            Complexity::Complex => self.complex.as_ref(),
        }
    }
}

/// Contents of `.fuel/config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelConfig {
    pub interval_seconds: u64,
    pub primary: String,
    pub review: ReviewConfig,
    pub complexity: ComplexityRouting,
    pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for FuelConfig {
    fn default() -> Self {
        let claude = AgentConfig::new("claude").with_args([
            "--print",
            PROMPT_PLACEHOLDER,
            "--output-format",
            "stream-json",
            "--verbose",
        ]);
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECS,
            primary: DEFAULT_AGENT.to_string(),
            review: ReviewConfig::default(),
            complexity: ComplexityRouting::default(),
            agents: BTreeMap::from([(DEFAULT_AGENT.to_string(), claude)]),
        }
    }
}

impl FuelConfig {
    /// Parse YAML text.
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::YamlParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from disk. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text, path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_seconds == 0 {
            return Err(ConfigError::Invalid("interval_seconds must be at least 1".into()));
        }
        for (name, agent) in &self.agents {
            if agent.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("agent `{name}` has no command")));
            }
        }
        Ok(())
    }
}

/// Read-only view of configuration used by the scheduling core.
pub trait ConfigService: Send + Sync {
    /// Agent that handles tasks of the given complexity.
    fn agent_for_complexity(&self, complexity: Complexity) -> String;

    /// Maximum concurrent processes for an agent.
    fn agent_limit(&self, agent: &str) -> usize;

    /// Consecutive failures after which an agent is considered dead.
    fn agent_max_retries(&self, agent: &str) -> u32;

    fn primary_agent(&self) -> String;

    fn review_agent(&self) -> String;

    fn review_enabled(&self) -> bool;

    /// Launch settings for an agent, `None` if it is not configured.
    fn agent_command(&self, agent: &str) -> Option<AgentConfig>;

    /// Configured agent names, sorted.
    fn agent_names(&self) -> Vec<String>;

    fn interval_seconds(&self) -> u64;

    /// Re-read the backing source.
    fn reload(&self) -> Result<(), ConfigError>;
}

/// [`ConfigService`] backed by a YAML file.
pub struct YamlConfig {
    path: Option<PathBuf>,
    current: RwLock<FuelConfig>,
}

impl YamlConfig {
    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = FuelConfig::load(&path)?;
        info!(path = %path.display(), agents = config.agents.len(), "Loaded configuration");
        Ok(Self {
            path: Some(path),
            current: RwLock::new(config),
        })
    }

    /// In-memory configuration with nothing to reload from.
    pub fn from_config(config: FuelConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(config),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FuelConfig> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConfigService for YamlConfig {
    fn agent_for_complexity(&self, complexity: Complexity) -> String {
        let config = self.read();
        config
            .complexity
            .get(complexity)
            .cloned()
            .unwrap_or_else(|| config.primary.clone())
    }

    fn agent_limit(&self, agent: &str) -> usize {
        self.read()
            .agents
            .get(agent)
            .map(|a| a.max_concurrent)
            .unwrap_or(DEFAULT_MAX_CONCURRENT)
    }

    fn agent_max_retries(&self, agent: &str) -> u32 {
        self.read()
            .agents
            .get(agent)
            .map(|a| a.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    fn primary_agent(&self) -> String {
        self.read().primary.clone()
    }

    fn review_agent(&self) -> String {
        let config = self.read();
        config
            .review
            .agent
            .clone()
            .unwrap_or_else(|| config.primary.clone())
    }

    fn review_enabled(&self) -> bool {
        self.read().review.enabled
    }

    fn agent_command(&self, agent: &str) -> Option<AgentConfig> {
        self.read().agents.get(agent).cloned()
    }

    fn agent_names(&self) -> Vec<String> {
        self.read().agents.keys().cloned().collect()
    }

    fn interval_seconds(&self) -> u64 {
        self.read().interval_seconds
    }

    fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = FuelConfig::load(path)?;
        info!(path = %path.display(), agents = fresh.agents.len(), "Reloaded configuration");
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
interval_seconds: 10
primary: claude
review:
  enabled: true
  agent: reviewer
complexity:
  trivial: haiku
agents:
  claude:
    command: claude
    args: ["-p", "{prompt}"]
    max_concurrent: 2
    max_retries: 3
  haiku:
    command: claude
    model: haiku
  reviewer:
    command: claude
"#;

    fn sample() -> YamlConfig {
        YamlConfig::from_config(FuelConfig::from_yaml(SAMPLE, Path::new("config.yaml")).unwrap())
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();
        assert_eq!(config.interval_seconds(), 10);
        assert_eq!(config.agent_limit("claude"), 2);
        assert_eq!(config.agent_max_retries("claude"), 3);
        assert_eq!(config.agent_limit("haiku"), 1);
        assert_eq!(config.agent_max_retries("haiku"), 5);
        assert!(config.review_enabled());
        assert_eq!(config.review_agent(), "reviewer");
        assert_eq!(config.agent_names(), vec!["claude", "haiku", "reviewer"]);
    }

    #[test]
    fn test_complexity_routing_falls_back_to_primary() {
        let config = sample();
        assert_eq!(config.agent_for_complexity(Complexity::Trivial), "haiku");
        assert_eq!(config.agent_for_complexity(Complexity::Complex), "claude");
    }

    #[test]
    fn test_unknown_agent_defaults() {
        let config = sample();
        assert_eq!(config.agent_limit("nobody"), 1);
        assert_eq!(config.agent_max_retries("nobody"), 5);
        assert!(config.agent_command("nobody").is_none());
    }

    #[test]
    fn test_render_args() {
        let agent = AgentConfig::new("claude").with_args(["-p", "{prompt}", "--verbose"]);
        assert_eq!(agent.render_args("do it"), vec!["-p", "do it", "--verbose"]);

        let bare = AgentConfig::new("codex").with_args(["exec"]);
        assert_eq!(bare.render_args("do it"), vec!["exec", "do it"]);
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = YamlConfig::load(dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.primary_agent(), "claude");
        assert_eq!(config.interval_seconds(), 5);
        assert!(!config.review_enabled());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let err = FuelConfig::from_yaml("agents: [1, 2", Path::new("x.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::YamlParse { .. }));

        let err = FuelConfig::from_yaml("interval_seconds: 0", Path::new("x.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "interval_seconds: 3\n").unwrap();

        let config = YamlConfig::load(&path).unwrap();
        assert_eq!(config.interval_seconds(), 3);

        std::fs::write(&path, "interval_seconds: 9\n").unwrap();
        config.reload().unwrap();
        assert_eq!(config.interval_seconds(), 9);
    }
}
