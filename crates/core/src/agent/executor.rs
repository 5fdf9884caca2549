use stepwise_model::{
    AssistantMessage, ModelMessage, ModelRequest, ModelTool, ToolCallRequest,
    ToolCallResult, ToolChoice,
};
use tracing::Instrument;

use super::event::{AgentEvent, EventSink, emit};
use crate::error::Error;
use crate::model_client::{ModelClient, ModelClientResponse};
use crate::pool::{Lease, LiveProvider};
use crate::tool::{self, ToolCallRecord, ToolOutput, ToolResolver};

/// The result text of a unit that ran out of rounds.
pub const ROUND_BUDGET_EXHAUSTED: &str = "Max tool rounds reached; ending turn.";

/// The stages of one unit of work.
#[derive(Debug)]
enum Stage {
    /// Waiting for the model to answer the transcript.
    AwaitingModel,
    /// The model asked for tools, which run in issue order.
    AwaitingTools(Vec<ToolCallRequest>),
    /// The model answered without tool calls.
    Complete(String),
}

/// What one unit of work is allowed to use.
pub(crate) struct Unit<'a> {
    /// The catalog shown to the model.
    pub tools: &'a [ModelTool],
    /// The plan step index, if running a plan.
    pub step: Option<usize>,
    /// The provider a pinned step is restricted to.
    pub pinned: Option<&'a LiveProvider>,
}

#[derive(Debug)]
pub(crate) struct UnitOutcome {
    pub text: String,
    pub rounds: usize,
    pub exhausted: bool,
}

/// Drives model and tool rounds until the model stops asking for tools or
/// the round budget runs out.
pub(crate) struct StepExecutor<'a> {
    pub model: &'a ModelClient,
    pub lease: &'a Lease,
    pub resolver: &'a ToolResolver,
    pub sink: Option<&'a EventSink>,
    pub max_rounds: usize,
    pub tool_calls: &'a mut Vec<ToolCallRecord>,
}

impl StepExecutor<'_> {
    /// Runs one unit on `transcript`, appending every assistant reply and
    /// tool result to it. A round is one model invocation; the counter
    /// starts at zero for every unit.
    pub async fn run(
        &mut self,
        transcript: &mut Vec<ModelMessage>,
        unit: &Unit<'_>,
    ) -> Result<UnitOutcome, Error> {
        let mut rounds = 0;
        let mut stage = Stage::AwaitingModel;
        loop {
            trace!("round {rounds}, stage {stage:?}");
            stage = match stage {
                Stage::AwaitingModel => {
                    if rounds >= self.max_rounds {
                        warn!("round budget of {} exhausted", self.max_rounds);
                        return Ok(UnitOutcome {
                            text: ROUND_BUDGET_EXHAUSTED.to_owned(),
                            rounds,
                            exhausted: true,
                        });
                    }
                    rounds += 1;

                    let resp = self.call_model(transcript, unit).await?;
                    transcript.push(ModelMessage::Assistant(AssistantMessage {
                        content: resp.text.clone(),
                        tool_calls: resp.tool_calls.clone(),
                    }));
                    if resp.tool_calls.is_empty() {
                        Stage::Complete(resp.text)
                    } else {
                        Stage::AwaitingTools(resp.tool_calls)
                    }
                }
                Stage::AwaitingTools(calls) => {
                    for call in calls {
                        self.run_tool(transcript, call, unit).await;
                    }
                    Stage::AwaitingModel
                }
                Stage::Complete(text) => {
                    debug!("unit complete after {rounds} rounds");
                    return Ok(UnitOutcome {
                        text,
                        rounds,
                        exhausted: false,
                    });
                }
            };
        }
    }

    async fn call_model(
        &self,
        transcript: &[ModelMessage],
        unit: &Unit<'_>,
    ) -> Result<ModelClientResponse, Error> {
        let req = ModelRequest {
            messages: transcript.to_vec(),
            tools: unit.tools.to_vec(),
            tool_choice: ToolChoice::Auto,
            ..Default::default()
        };
        let sink = self.sink.cloned();
        let step = unit.step;
        let on_delta = move |content: String| {
            emit(
                sink.as_ref(),
                AgentEvent::AssistantMessage {
                    content,
                    step,
                    complete: false,
                },
            );
        };
        self.model
            .send_request(req, on_delta)
            .await
            .map_err(Error::ModelCall)
    }

    async fn run_tool(
        &mut self,
        transcript: &mut Vec<ModelMessage>,
        call: ToolCallRequest,
        unit: &Unit<'_>,
    ) {
        let ToolCallRequest {
            id,
            name,
            arguments,
        } = call;
        emit(
            self.sink,
            AgentEvent::ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
                step: unit.step,
            },
        );
        self.tool_calls.push(ToolCallRecord {
            name: name.clone(),
            arguments: arguments.clone(),
        });

        let span = debug_span!("tool", id = %id, name = %name);
        let output = match unit.pinned {
            Some(provider) if provider.serves(&name) => {
                self.resolver
                    .invoke(provider, &name, arguments)
                    .instrument(span)
                    .await
            }
            Some(provider) => {
                debug!("{name} is outside the pinned provider {}", provider.config().id);
                ToolOutput::from(tool::Error::unresolved(&name).with_reason(
                    format!("tool {name} is not available in this step"),
                ))
            }
            None => {
                self.resolver
                    .call(self.lease, &name, arguments)
                    .instrument(span)
                    .await
            }
        };

        emit(
            self.sink,
            AgentEvent::ToolResult {
                id: id.clone(),
                name,
                content: output.text.clone(),
                is_error: output.is_error,
                step: unit.step,
            },
        );
        let content = if output.is_error {
            format!("Error: {}", output.text)
        } else {
            output.text
        };
        transcript.push(ModelMessage::Tool(ToolCallResult { id, content }));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stepwise_test_model::{PresetResponse, TestModelProvider};

    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::testing::FakeTransport;

    struct Fixture {
        provider: TestModelProvider,
        model: ModelClient,
        lease: Lease,
        catalog: Vec<ModelTool>,
        _pool: ConnectionPool,
    }

    async fn fixture() -> Fixture {
        let transport = FakeTransport::default();
        let fs = transport.add_provider("fs", &["read_file"]);
        let pool = ConnectionPool::new(transport, PoolConfig::default());
        let lease = pool.acquire(&[fs]).await.unwrap();
        let catalog = lease.tools().iter().map(|t| t.to_model_tool()).collect();
        let provider = TestModelProvider::default();
        Fixture {
            model: ModelClient::new(provider.clone()),
            provider,
            lease,
            catalog,
            _pool: pool,
        }
    }

    fn read_file(id: &str) -> PresetResponse {
        PresetResponse::tool_call(id, "read_file", json!({ "path": "a.txt" }))
    }

    async fn run_unit(
        fixture: &Fixture,
        max_rounds: usize,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> (UnitOutcome, Vec<ModelMessage>) {
        let resolver = ToolResolver::new();
        let mut executor = StepExecutor {
            model: &fixture.model,
            lease: &fixture.lease,
            resolver: &resolver,
            sink: None,
            max_rounds,
            tool_calls,
        };
        let mut transcript = vec![ModelMessage::User("go".to_owned())];
        let unit = Unit {
            tools: &fixture.catalog,
            step: None,
            pinned: None,
        };
        let outcome = executor.run(&mut transcript, &unit).await.unwrap();
        (outcome, transcript)
    }

    #[tokio::test]
    async fn test_stops_after_k_rounds() {
        let fixture = fixture().await;
        fixture.provider.add_response(read_file("call_1"));
        fixture.provider.add_response(read_file("call_2"));
        fixture.provider.add_response(PresetResponse::text("done"));

        let mut tool_calls = vec![];
        let (outcome, transcript) = run_unit(&fixture, 5, &mut tool_calls).await;
        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.rounds, 3);
        assert!(!outcome.exhausted);
        assert_eq!(tool_calls.len(), 2);
        assert_eq!(fixture.provider.request_count(), 3);

        // user, (assistant, tool) x 2, assistant
        assert_eq!(transcript.len(), 6);
        assert_eq!(
            transcript[2],
            ModelMessage::Tool(ToolCallResult {
                id: "call_1".to_owned(),
                content: "read_file done".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let fixture = fixture().await;
        fixture.provider.set_fallback(read_file("call"));

        let mut tool_calls = vec![];
        let (outcome, _) = run_unit(&fixture, 3, &mut tool_calls).await;
        assert_eq!(outcome.text, ROUND_BUDGET_EXHAUSTED);
        assert_eq!(outcome.rounds, 3);
        assert!(outcome.exhausted);
        assert!(tool_calls.len() >= 3);
        assert_eq!(fixture.provider.request_count(), 3);
    }

    #[tokio::test]
    async fn test_tools_run_in_issue_order() {
        let fixture = fixture().await;
        fixture.provider.add_response(PresetResponse::with_events([
            stepwise_test_model::PresetEvent::ToolCall(ToolCallRequest {
                id: "a".to_owned(),
                name: "read_file".to_owned(),
                arguments: json!({}),
            }),
            stepwise_test_model::PresetEvent::ToolCall(ToolCallRequest {
                id: "b".to_owned(),
                name: "unknown_tool".to_owned(),
                arguments: json!({}),
            }),
        ]));
        fixture.provider.add_response(PresetResponse::text("ok"));

        let mut tool_calls = vec![];
        let (outcome, transcript) = run_unit(&fixture, 5, &mut tool_calls).await;
        assert_eq!(outcome.text, "ok");
        let names: Vec<_> = tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["read_file", "unknown_tool"]);
        assert_eq!(
            transcript[3].text(),
            "Error: no provider serves tool unknown_tool"
        );
    }
}
