use stepwise_core::conversation::ConversationMessage;
use stepwise_core::pool::ConnectionPool;
use stepwise_core::provider::ToolProviderConfig;
use stepwise_core::{
    Agent, AgentBuilder, AgentChatResult, ChatOptions, Error, EventSink,
    ModelResolver,
};
use stepwise_mcp::StdioTransport;
use stepwise_model::ModelProvider;

use crate::config::{EndpointResolver, Settings};

/// A session builder.
///
/// See [`Session`].
pub struct SessionBuilder {
    agent_builder: AgentBuilder,
    options: ChatOptions,
}

impl SessionBuilder {
    /// Creates a session builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(
        provider: M,
    ) -> Self {
        Self {
            agent_builder: AgentBuilder::with_model_provider(provider),
            options: ChatOptions::default(),
        }
    }

    /// Creates a session builder that resolves the model per call.
    pub fn with_model_resolver<R: ModelResolver>(resolver: R) -> Self {
        Self {
            agent_builder: AgentBuilder::with_model_resolver(resolver),
            options: ChatOptions::default(),
        }
    }

    /// Creates a session builder from loaded settings.
    ///
    /// Providers are launched as stdio processes and pooled with the
    /// configured tuning.
    pub fn from_settings(settings: &Settings) -> Self {
        let resolver =
            EndpointResolver::new(settings.model_settings().as_ref());
        if !resolver.is_configured() {
            warn!("no model endpoint configured");
        }
        let pool = ConnectionPool::new(
            StdioTransport::default(),
            settings.pool_config(),
        );
        let mut builder = Self::with_model_resolver(resolver)
            .with_providers(settings.provider_configs())
            .with_connection_pool(pool)
            .with_options(settings.chat_options());
        if let Some(prompt) = &settings.agent.system_prompt {
            builder = builder.with_system_prompt(prompt);
        }
        builder
    }

    /// Sets the system prompt for the agent.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.agent_builder = self.agent_builder.with_system_prompt(prompt);
        self
    }

    /// Sets the tool providers.
    #[inline]
    pub fn with_providers(mut self, providers: Vec<ToolProviderConfig>) -> Self {
        self.agent_builder = self.agent_builder.with_providers(providers);
        self
    }

    /// Uses an existing connection pool.
    #[inline]
    pub fn with_connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.agent_builder = self.agent_builder.with_connection_pool(pool);
        self
    }

    /// Sets the options every message is sent with.
    #[inline]
    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds a new session.
    pub fn build(self) -> Session {
        Session {
            agent: self.agent_builder.build(),
            options: self.options,
            history: vec![],
        }
    }
}

/// A chat session, like a window that displays messages and has a input box.
///
/// The session keeps the user and assistant messages of every completed
/// turn and sends them along with the next message. A failed turn leaves
/// the history untouched.
pub struct Session {
    agent: Agent,
    options: ChatOptions,
    history: Vec<ConversationMessage>,
}

impl Session {
    /// Sends a message to the session and waits for the answer.
    pub async fn send_message(
        &mut self,
        message: &str,
        sink: Option<&EventSink>,
    ) -> Result<AgentChatResult, Error> {
        let user = ConversationMessage::user(message);
        let mut conversation = Vec::with_capacity(self.history.len() + 1);
        conversation.extend_from_slice(&self.history);
        conversation.push(user.clone());

        let result = self.agent.chat(&conversation, &self.options, sink).await?;

        self.history.push(user);
        self.history
            .push(ConversationMessage::assistant(result.message.clone()));
        Ok(result)
    }

    /// The messages of the completed turns.
    #[inline]
    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    /// Forgets the conversation so far.
    #[inline]
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// The options messages are sent with.
    #[inline]
    pub fn options_mut(&mut self) -> &mut ChatOptions {
        &mut self.options
    }

    /// The underlying agent.
    #[inline]
    pub fn agent(&self) -> &Agent {
        &self.agent
    }
}

#[cfg(test)]
mod tests {
    use stepwise_core::conversation::Role;
    use stepwise_model::ErrorKind;
    use stepwise_test_model::{PresetResponse, TestModelProvider};

    use super::*;

    #[tokio::test]
    async fn test_history_carries_over() {
        let model = TestModelProvider::default();
        model.add_response(PresetResponse::text("Paris"));
        model.add_response(PresetResponse::text("About 2.1 million"));
        let mut session = SessionBuilder::with_model_provider(model.clone())
            .with_options(ChatOptions::default().with_planning(false))
            .build();

        session
            .send_message("What is the capital of France?", None)
            .await
            .unwrap();
        let result = session
            .send_message("How many people live there?", None)
            .await
            .unwrap();
        assert_eq!(result.message, "About 2.1 million");

        let roles: Vec<Role> =
            session.history().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [Role::User, Role::Assistant, Role::User, Role::Assistant]
        );

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        let second: Vec<&str> =
            requests[1].messages.iter().map(|m| m.text()).collect();
        assert!(second.iter().any(|t| t.contains("capital of France")));
        assert!(second.iter().any(|t| t.contains("Paris")));
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_history() {
        let model = TestModelProvider::default();
        model.add_response(PresetResponse::text("hi").with_failures(1));
        let mut session =
            SessionBuilder::with_model_provider(model.clone()).build();

        let err = session.send_message("hello", None).await.unwrap_err();
        assert_eq!(err.model_error_kind(), Some(ErrorKind::Other));
        assert!(session.history().is_empty());
    }
}
