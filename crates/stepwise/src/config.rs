//! File and environment configuration of the `stepwise` application.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Debug};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use stepwise_core::pool::PoolConfig;
use stepwise_core::provider::ToolProviderConfig;
use stepwise_core::{ChatOptions, ModelClient, ModelResolver};
use stepwise_openai_model::{
    DEFAULT_BASE_URL, OpenAIConfigBuilder, OpenAIProvider,
};
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "STEPWISE_CONFIG";

/// File looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "stepwise.toml";

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// The file is not valid TOML for these settings.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: toml::de::Error,
    },
    /// The settings are well-formed but inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The whole configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// The model endpoint. Falls back to the `OPENAI_*` variables.
    pub model: Option<ModelSettings>,
    /// Chat defaults.
    pub agent: AgentSettings,
    /// Connection pool tuning.
    pub pool: PoolSettings,
    /// Tool providers.
    pub providers: Vec<ProviderSettings>,
}

/// `[model]`
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSettings {
    /// API root of an OpenAI-compatible server.
    pub base_url: Option<String>,
    /// Default model.
    pub model: Option<String>,
    /// API key, may be omitted for local servers.
    pub api_key: Option<String>,
}

impl Debug for ModelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `[agent]`
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    /// Model invocations allowed per unit of work.
    pub max_rounds: usize,
    /// Whether multi-step requests are planned first.
    pub planning: bool,
    /// Replaces the built-in system prompt.
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let options = ChatOptions::default();
        Self {
            max_rounds: options.max_rounds,
            planning: options.planning,
            system_prompt: None,
        }
    }
}

/// `[pool]`
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Seconds an unused connection is kept open.
    pub max_idle_secs: u64,
    /// Seconds between idle sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let config = PoolConfig::default();
        Self {
            max_idle_secs: config.max_idle.as_secs(),
            sweep_interval_secs: config.sweep_interval.as_secs(),
        }
    }
}

/// `[[providers]]`
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    /// Stable identifier.
    pub id: String,
    /// Display name, defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Executable to launch.
    pub command: String,
    /// Command line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.to_provider_config(), f)
    }
}

impl ProviderSettings {
    /// Converts to the core's launch descriptor.
    pub fn to_provider_config(&self) -> ToolProviderConfig {
        let mut config = ToolProviderConfig::new(&self.id, &self.command)
            .with_args(self.args.iter().cloned());
        if let Some(name) = &self.name {
            config = config.with_name(name);
        }
        for (key, value) in &self.env {
            config = config.with_env(key, value);
        }
        config
    }
}

impl Settings {
    /// Parses settings from TOML text.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads the settings file.
    ///
    /// The file is `explicit` if given, else `$STEPWISE_CONFIG`, else
    /// `./stepwise.toml` when it exists. With none of them the defaults
    /// are used and the returned path is `None`.
    pub fn load(
        explicit: Option<&Path>,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_owned()),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .or_else(|| {
                    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                    local.is_file().then_some(local)
                }),
        };
        let Some(path) = path else {
            debug!("no configuration file, using defaults");
            return Ok((Self::default(), None));
        };

        let text = std::fs::read_to_string(&path).map_err(|source| {
            ConfigError::Read {
                path: path.clone(),
                source,
            }
        })?;
        let settings = Self::from_toml(&text, &path)?;
        info!(
            "loaded {} with {} providers",
            path.display(),
            settings.providers.len()
        );
        Ok((settings, Some(path)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "provider id must not be empty".to_owned(),
                ));
            }
            if provider.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider `{}` has no command",
                    provider.id
                )));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id `{}`",
                    provider.id
                )));
            }
        }
        Ok(())
    }

    /// The provider configurations in file order.
    pub fn provider_configs(&self) -> Vec<ToolProviderConfig> {
        self.providers
            .iter()
            .map(ProviderSettings::to_provider_config)
            .collect()
    }

    /// Pool tuning.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_max_idle(Duration::from_secs(self.pool.max_idle_secs))
            .with_sweep_interval(Duration::from_secs(
                self.pool.sweep_interval_secs.max(1),
            ))
    }

    /// Default options of a chat call.
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions::default()
            .with_max_rounds(self.agent.max_rounds)
            .with_planning(self.agent.planning)
    }

    /// The model endpoint, from `[model]` or from the environment.
    pub fn model_settings(&self) -> Option<ModelSettings> {
        self.model_settings_with(|key| std::env::var(key).ok())
    }

    fn model_settings_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Option<ModelSettings> {
        if let Some(model) = &self.model {
            return Some(model.clone());
        }
        let api_key = env("OPENAI_API_KEY").filter(|v| !v.is_empty());
        let base_url = env("OPENAI_BASE_URL").filter(|v| !v.is_empty());
        if api_key.is_none() && base_url.is_none() {
            return None;
        }
        Some(ModelSettings {
            base_url,
            model: env("OPENAI_MODEL").filter(|v| !v.is_empty()),
            api_key,
        })
    }
}

/// Resolves the model endpoint of [`Settings`] for each chat call.
#[derive(Clone, Debug)]
pub struct EndpointResolver {
    provider: Option<OpenAIProvider>,
}

impl EndpointResolver {
    /// Creates a resolver; `None` leaves the endpoint unconfigured.
    pub fn new(settings: Option<&ModelSettings>) -> Self {
        let provider = settings.map(|settings| {
            let mut builder = OpenAIConfigBuilder::with_api_key(
                settings.api_key.clone().unwrap_or_default(),
            )
            .with_base_url(
                settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            );
            if let Some(model) = &settings.model {
                builder = builder.with_model(model);
            }
            OpenAIProvider::new(builder.build())
        });
        Self { provider }
    }

    /// Whether an endpoint is configured.
    #[inline]
    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }
}

impl ModelResolver for EndpointResolver {
    fn resolve(&self, model: Option<&str>) -> Option<ModelClient> {
        let provider = self.provider.as_ref()?;
        Some(match model {
            Some(model) => ModelClient::new(provider.with_model(model)),
            None => ModelClient::new(provider.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SAMPLE: &str = r#"
[model]
base_url = "http://localhost:11434/v1/"
model = "qwen2.5"

[agent]
max_rounds = 3
planning = false

[pool]
max_idle_secs = 120

[[providers]]
id = "fs"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]

[[providers]]
id = "notes"
name = "Notes"
command = "notes-mcp"
env = { NOTES_TOKEN = "abc" }
"#;

    fn parse(text: &str) -> Result<Settings, ConfigError> {
        Settings::from_toml(text, Path::new("test.toml"))
    }

    #[test]
    fn test_parse_sample() {
        let settings = parse(SAMPLE).unwrap();

        let options = settings.chat_options();
        assert_eq!(options.max_rounds, 3);
        assert!(!options.planning);

        let pool = settings.pool_config();
        assert_eq!(pool.max_idle, Duration::from_secs(120));
        assert_eq!(pool.sweep_interval, Duration::from_secs(60));

        let providers = settings.provider_configs();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].name, "fs");
        assert_eq!(providers[0].args.len(), 3);
        assert_eq!(providers[1].name, "Notes");
        assert_eq!(providers[1].env.get("NOTES_TOKEN").unwrap(), "abc");
        assert!(!format!("{:?}", settings.providers[1]).contains("abc"));
    }

    #[test]
    fn test_defaults_without_file_content() {
        let settings = parse("").unwrap();
        assert_eq!(settings.chat_options(), ChatOptions::default());
        assert!(settings.providers.is_empty());
        assert!(settings.model_settings_with(|_| None).is_none());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let text = r#"
[[providers]]
id = "fs"
command = "a"

[[providers]]
id = "fs"
command = "b"
"#;
        let err = parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = parse("[agent]\nmax_tool_rounds = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn test_env_fallback() {
        let settings = parse("").unwrap();
        let env: HashMap<&str, &str> = [
            ("OPENAI_BASE_URL", "http://localhost:8080/v1"),
            ("OPENAI_MODEL", "local-model"),
        ]
        .into_iter()
        .collect();
        let model = settings
            .model_settings_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(model.base_url.as_deref(), Some("http://localhost:8080/v1"));
        assert_eq!(model.model.as_deref(), Some("local-model"));
        assert_eq!(model.api_key, None);

        let explicit = parse(SAMPLE).unwrap();
        let model = explicit
            .model_settings_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(model.model.as_deref(), Some("qwen2.5"));
    }

    #[test]
    fn test_endpoint_resolver() {
        assert!(EndpointResolver::new(None).resolve(None).is_none());

        let settings = parse(SAMPLE).unwrap();
        let resolver = EndpointResolver::new(settings.model.as_ref());
        assert!(resolver.is_configured());
        assert!(resolver.resolve(Some("other")).is_some());
        let provider = resolver.provider.as_ref().unwrap();
        assert_eq!(provider.config().base_url(), "http://localhost:11434/v1");
        assert_eq!(provider.config().model(), "qwen2.5");
    }
}
