use std::sync::Arc;

use async_trait::async_trait;
use stepwise_model::ModelProvider;

use super::{Agent, Inner, prompt};
use crate::model_client::{FixedModel, ModelClient, ModelResolver};
use crate::planner::Planner;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::provider::{
    ProviderConfigStore, ProviderSession, ProviderTransport, StaticProviderStore,
    ToolProviderConfig, TransportError,
};
use crate::tool::ToolResolver;

/// [`Agent`] builder.
pub struct AgentBuilder {
    models: Box<dyn ModelResolver>,
    providers: Option<Box<dyn ProviderConfigStore>>,
    pool: Option<ConnectionPool>,
    planner: Planner,
    system_prompt: String,
}

impl AgentBuilder {
    /// Creates a new builder that sends every call to one model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self::with_model_resolver(FixedModel(ModelClient::new(provider)))
    }

    /// Creates a new builder that picks the model endpoint per call.
    #[inline]
    pub fn with_model_resolver<R: ModelResolver>(resolver: R) -> Self {
        Self {
            models: Box::new(resolver),
            providers: None,
            pool: None,
            planner: Planner::default(),
            system_prompt: prompt::DEFAULT_SYSTEM_PROMPT.to_owned(),
        }
    }

    /// Sets where provider configurations are read from.
    #[inline]
    pub fn with_provider_store<S: ProviderConfigStore>(mut self, store: S) -> Self {
        self.providers = Some(Box::new(store));
        self
    }

    /// Uses a fixed list of providers.
    #[inline]
    pub fn with_providers(self, providers: Vec<ToolProviderConfig>) -> Self {
        self.with_provider_store(StaticProviderStore::new(providers))
    }

    /// Shares an existing connection pool.
    #[inline]
    pub fn with_connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Replaces the planner settings.
    #[inline]
    pub fn with_planner(mut self, planner: Planner) -> Self {
        self.planner = planner;
        self
    }

    /// Replaces the system prompt. An empty prompt sends none.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Builds the agent.
    ///
    /// Without a connection pool, the agent can only run with an empty
    /// provider set. Must be called within a tokio runtime.
    pub fn build(self) -> Agent {
        let AgentBuilder {
            models,
            providers,
            pool,
            planner,
            system_prompt,
        } = self;

        let providers = providers
            .unwrap_or_else(|| Box::new(StaticProviderStore::default()));
        let pool = pool.unwrap_or_else(|| {
            ConnectionPool::new(NoTransport, PoolConfig::default())
        });
        Agent {
            inner: Arc::new(Inner {
                models,
                providers,
                pool,
                resolver: ToolResolver::new(),
                planner,
                system_prompt,
            }),
        }
    }
}

struct NoTransport;

#[async_trait]
impl ProviderTransport for NoTransport {
    async fn connect(
        &self,
        config: &ToolProviderConfig,
    ) -> Result<Box<dyn ProviderSession>, TransportError> {
        Err(TransportError::Launch(format!(
            "no provider transport configured for {}",
            config.id
        )))
    }
}
