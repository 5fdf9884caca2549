//! Tool providers: their configurations, the transport seam used to talk to
//! them, and the store the agent reads configurations from.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stepwise_model::ModelTool;
use thiserror::Error;

/// Launch descriptor of one tool provider.
///
/// Configurations are plain values owned by the store; the core only reads
/// them and never keeps live state inside them.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    /// Stable identifier.
    pub id: String,
    /// Human readable name, used by plan steps to pin a provider.
    pub name: String,
    /// Executable to launch.
    pub command: String,
    /// Command line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ToolProviderConfig {
    /// Creates a configuration whose name equals its id.
    pub fn new<I, C>(id: I, command: C) -> Self
    where
        I: Into<String>,
        C: Into<String>,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: command.into(),
            args: vec![],
            env: BTreeMap::new(),
        }
    }

    /// Sets the display name.
    #[inline]
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Appends command line arguments.
    #[inline]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment variable.
    #[inline]
    pub fn with_env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Whether `key` names this provider, by id or by display name.
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name == key
    }
}

fn is_secret(key: &str) -> bool {
    let key = key.to_ascii_uppercase();
    ["KEY", "TOKEN", "SECRET"].iter().any(|s| key.contains(s))
}

impl Debug for ToolProviderConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let env: BTreeMap<_, _> = self
            .env
            .iter()
            .map(|(k, v)| {
                let v = if is_secret(k) { "<redacted>" } else { v.as_str() };
                (k.as_str(), v)
            })
            .collect();
        f.debug_struct("ToolProviderConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &env)
            .finish()
    }
}

/// A tool as advertised by a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique within the merged catalog.
    pub name: String,
    /// What the tool does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments.
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    /// Creates a descriptor without description or schema.
    #[inline]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }

    /// Sets the description.
    #[inline]
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the argument schema.
    #[inline]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Converts into the definition presented to the model. A missing
    /// schema is presented as an object without properties.
    pub fn to_model_tool(&self) -> ModelTool {
        ModelTool {
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            parameters: self
                .input_schema
                .clone()
                .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
        }
    }
}

/// One content part of a tool call result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentPart {
    /// Plain text.
    Text(String),
    /// Binary image data, only its type is kept.
    Image {
        /// The MIME type of the image.
        mime_type: String,
    },
    /// An embedded resource.
    Resource {
        /// The resource URI.
        uri: String,
        /// The inline text of the resource, if any.
        text: Option<String>,
    },
}

/// The raw result of a `tools/call` request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallToolOutput {
    /// Content parts in provider order.
    pub content: Vec<ContentPart>,
    /// Whether the provider flagged the call as failed.
    pub is_error: bool,
}

impl CallToolOutput {
    /// A successful result with one text part.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            content: vec![ContentPart::Text(text.into())],
            is_error: false,
        }
    }
}

/// Failure reported by a provider transport.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The provider process could not be started.
    #[error("failed to launch provider: {0}")]
    Launch(String),
    /// The provider did not complete the protocol handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The connection is gone.
    #[error("connection closed")]
    Closed,
    /// The provider did not answer in time.
    #[error("request timed out")]
    Timeout,
    /// The provider answered with an error.
    #[error("provider error {code}: {message}")]
    Remote {
        /// The error code.
        code: i64,
        /// The error message.
        message: String,
    },
    /// The provider sent something that could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Opens sessions to tool providers.
#[async_trait]
pub trait ProviderTransport: Send + Sync + 'static {
    /// Launches the provider and completes its handshake.
    async fn connect(
        &self,
        config: &ToolProviderConfig,
    ) -> Result<Box<dyn ProviderSession>, TransportError>;
}

/// A live session with one provider.
#[async_trait]
pub trait ProviderSession: Send + Sync + 'static {
    /// Lists the tools the provider serves.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError>;

    /// Calls one tool.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolOutput, TransportError>;

    /// Tears the session down. Closing twice is a no-op.
    async fn close(&self);

    /// Whether the session can no longer serve calls, either because it was
    /// closed or because the provider went away.
    fn is_closed(&self) -> bool;
}

/// Source of provider configurations.
///
/// The agent takes one snapshot per operation, so edits made while a chat
/// is running only affect later calls.
pub trait ProviderConfigStore: Send + Sync + 'static {
    /// Returns the configured providers in priority order.
    fn list_providers(&self) -> Vec<ToolProviderConfig>;
}

impl<F> ProviderConfigStore for F
where
    F: Fn() -> Vec<ToolProviderConfig> + Send + Sync + 'static,
{
    #[inline]
    fn list_providers(&self) -> Vec<ToolProviderConfig> {
        self()
    }
}

/// An in-memory, shareable provider store.
#[derive(Clone, Debug, Default)]
pub struct StaticProviderStore {
    providers: Arc<RwLock<Vec<ToolProviderConfig>>>,
}

impl StaticProviderStore {
    /// Creates a store holding `providers`.
    #[inline]
    pub fn new(providers: Vec<ToolProviderConfig>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
        }
    }

    /// Inserts a provider or replaces the one with the same id.
    pub fn upsert(&self, config: ToolProviderConfig) {
        let mut providers = self.write();
        match providers.iter_mut().find(|p| p.id == config.id) {
            Some(existing) => *existing = config,
            None => providers.push(config),
        }
    }

    /// Removes a provider, returning whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let mut providers = self.write();
        let before = providers.len();
        providers.retain(|p| p.id != id);
        providers.len() != before
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ToolProviderConfig>> {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProviderConfigStore for StaticProviderStore {
    fn list_providers(&self) -> Vec<ToolProviderConfig> {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ToolProviderConfig::new("search", "search-server")
            .with_env("API_KEY", "sk-123")
            .with_env("github_token", "ghp-456")
            .with_env("REGION", "eu");
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-123"));
        assert!(!debug.contains("ghp-456"));
        assert!(debug.contains("eu"));
    }

    #[test]
    fn test_default_schema() {
        let tool = ToolDescriptor::new("list").to_model_tool();
        assert_eq!(tool.parameters, json!({ "type": "object", "properties": {} }));
        assert_eq!(tool.description, "");
    }

    #[test]
    fn test_static_store() {
        let store = StaticProviderStore::default();
        store.upsert(ToolProviderConfig::new("fs", "fs-server"));
        store.upsert(ToolProviderConfig::new("web", "web-server"));
        store.upsert(ToolProviderConfig::new("fs", "fs-server-v2"));

        let providers = store.list_providers();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].command, "fs-server-v2");

        assert!(store.remove("web"));
        assert!(!store.remove("web"));
        assert_eq!(store.list_providers().len(), 1);
    }

    #[test]
    fn test_closure_store() {
        let store = || vec![ToolProviderConfig::new("fs", "fs-server")];
        assert_eq!(ProviderConfigStore::list_providers(&store).len(), 1);
    }
}
