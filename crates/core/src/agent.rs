mod builder;
mod event;
mod executor;
mod prompt;

use std::slice;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stepwise_model::{ModelMessage, ModelTool};
use tracing::Instrument;

pub use builder::AgentBuilder;
pub use event::{AgentEvent, EventSink};
use event::emit;
pub use executor::ROUND_BUDGET_EXHAUSTED;
use executor::{StepExecutor, Unit};
pub use prompt::DEFAULT_SYSTEM_PROMPT;

use crate::conversation::{ConversationMessage, build_transcript};
use crate::error::{ConnectError, Error};
use crate::flow::{self, FlowRequest, FlowResult};
use crate::model_client::ModelResolver;
use crate::planner::{Plan, PlanStep, Planner};
use crate::pool::{ConnectionPool, Lease, LiveProvider, merge_catalog};
use crate::provider::{ProviderConfigStore, ToolDescriptor, ToolProviderConfig};
use crate::tool::{ToolCallRecord, ToolResolver};

/// Per-call options of [`Agent::chat`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatOptions {
    /// Overrides the model of the configured endpoint.
    pub model: Option<String>,
    /// Model invocations allowed per unit of work. Values below one are
    /// treated as one.
    #[serde(alias = "maxToolRounds")]
    pub max_rounds: usize,
    /// Whether multi-step requests are planned first.
    pub planning: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_rounds: 5,
            planning: true,
        }
    }
}

impl ChatOptions {
    /// Sets the model override.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the round budget.
    #[inline]
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Enables or disables planning.
    #[inline]
    pub fn with_planning(mut self, planning: bool) -> Self {
        self.planning = planning;
        self
    }
}

/// The result of a completed chat call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentChatResult {
    /// The final answer.
    pub message: String,
    /// How many tool calls were issued.
    pub tool_calls_used: usize,
    /// Every tool call in issue order.
    pub tool_calls: Vec<ToolCallRecord>,
}

struct Inner {
    models: Box<dyn ModelResolver>,
    providers: Box<dyn ProviderConfigStore>,
    pool: ConnectionPool,
    resolver: ToolResolver,
    planner: Planner,
    system_prompt: String,
}

/// The orchestrator: plans requests and drives model and tool rounds over
/// pooled provider connections.
///
/// Cloning is cheap, clones share the pool and the tool memo. Concurrent
/// chat calls are independent apart from the pool.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    /// Answers a conversation.
    ///
    /// When a sink is given, events are pushed to it while the call runs
    /// and exactly one [`AgentEvent::FinalMessage`] ends a successful call.
    /// A failed call emits no final event.
    pub async fn chat(
        &self,
        conversation: &[ConversationMessage],
        options: &ChatOptions,
        sink: Option<&EventSink>,
    ) -> Result<AgentChatResult, Error> {
        let span = info_span!("chat", messages = conversation.len());
        self.run_chat(conversation, options, sink)
            .instrument(span)
            .await
    }

    async fn run_chat(
        &self,
        conversation: &[ConversationMessage],
        options: &ChatOptions,
        sink: Option<&EventSink>,
    ) -> Result<AgentChatResult, Error> {
        let inner = &*self.inner;
        let Some(model) = inner.models.resolve(options.model.as_deref()) else {
            warn!("no model endpoint is configured");
            return Err(Error::Configuration);
        };

        let providers = inner.providers.list_providers();
        let lease = inner.pool.acquire(&providers).await?;
        let catalog: Vec<ModelTool> =
            lease.tools().iter().map(ToolDescriptor::to_model_tool).collect();
        debug!(
            "{} providers serve {} tools",
            providers.len(),
            catalog.len()
        );

        let plan = if options.planning && !catalog.is_empty() {
            inner.planner.classify(&model, conversation, &lease).await
        } else {
            Plan::default()
        };

        let mut transcript = build_transcript(&inner.system_prompt, conversation);
        let mut tool_calls = vec![];
        let mut executor = StepExecutor {
            model: &model,
            lease: &lease,
            resolver: &inner.resolver,
            sink,
            max_rounds: options.max_rounds.max(1),
            tool_calls: &mut tool_calls,
        };

        let message = if plan.is_empty() {
            let unit = Unit {
                tools: &catalog,
                step: None,
                pinned: None,
            };
            executor.run(&mut transcript, &unit).await?.text
        } else {
            emit(
                sink,
                AgentEvent::Plan {
                    steps: plan.steps().to_vec(),
                },
            );
            let last = plan.steps().len() - 1;
            let mut previous: Option<String> = None;
            for (index, step) in plan.steps().iter().enumerate() {
                info!("step {}/{}: {}", index + 1, last + 1, step.description);
                transcript.push(ModelMessage::User(prompt::step_instruction(
                    &plan,
                    index,
                    previous.as_deref(),
                )));

                let pinned = pinned_provider(&lease, step);
                let tools = match pinned {
                    Some(provider) => merge_catalog([provider])
                        .iter()
                        .map(ToolDescriptor::to_model_tool)
                        .collect(),
                    None => catalog.clone(),
                };
                let unit = Unit {
                    tools: &tools,
                    step: Some(index),
                    pinned,
                };
                let outcome = executor.run(&mut transcript, &unit).await?;
                debug!(
                    "step {} took {} rounds (exhausted: {})",
                    index + 1,
                    outcome.rounds,
                    outcome.exhausted
                );
                if index < last {
                    emit(
                        sink,
                        AgentEvent::AssistantMessage {
                            content: outcome.text.clone(),
                            step: Some(index),
                            complete: true,
                        },
                    );
                }
                previous = Some(outcome.text);
            }
            previous.unwrap_or_default()
        };

        let tool_calls_used = tool_calls.len();
        emit(
            sink,
            AgentEvent::FinalMessage {
                message: message.clone(),
                tool_calls_used,
            },
        );
        Ok(AgentChatResult {
            message,
            tool_calls_used,
            tool_calls,
        })
    }

    /// Returns the merged catalog of the configured providers.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ConnectError> {
        let providers = self.inner.providers.list_providers();
        let lease = self.inner.pool.acquire(&providers).await?;
        Ok(lease.tools())
    }

    /// Connects one provider, lists its tools and tears the connection
    /// down again.
    pub async fn probe_provider(
        &self,
        config: &ToolProviderConfig,
    ) -> Result<Vec<ToolDescriptor>, ConnectError> {
        let lease = self.inner.pool.acquire(slice::from_ref(config)).await?;
        let tools = lease.tools();
        let fingerprint = lease.fingerprint().clone();
        lease.release();
        self.inner.pool.close(&fingerprint).await;
        info!("provider {} serves {} tools", config.id, tools.len());
        Ok(tools)
    }

    /// Runs a fixed tool pipeline over the configured providers.
    pub async fn run_flow(
        &self,
        request: &FlowRequest,
    ) -> Result<FlowResult, ConnectError> {
        let providers = self.inner.providers.list_providers();
        let lease = self.inner.pool.acquire(&providers).await?;
        let result = flow::run(&self.inner.resolver, &lease, request)
            .instrument(info_span!("flow", nodes = request.nodes.len()))
            .await;
        Ok(result)
    }

    /// The connection pool of this agent.
    #[inline]
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }
}

fn pinned_provider<'a>(lease: &'a Lease, step: &PlanStep) -> Option<&'a LiveProvider> {
    let server = step.server.as_deref()?;
    let provider = lease.provider(server);
    if provider.is_none() {
        warn!("step is pinned to unknown provider {server}, using all tools");
    }
    provider
}
