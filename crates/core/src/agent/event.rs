use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::planner::PlanStep;

/// Where an agent pushes [`AgentEvent`]s while a chat call runs.
///
/// A dropped receiver only means nobody is watching: the call goes on and
/// its events are discarded.
pub type EventSink = mpsc::UnboundedSender<AgentEvent>;

/// Observability events of a chat call.
///
/// `step` is the zero-based plan step index, absent when the call runs
/// without a plan.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The model issued a tool call.
    ToolCall {
        /// The call id assigned by the model.
        id: String,
        /// The tool name.
        name: String,
        /// The arguments.
        arguments: Value,
        /// The plan step.
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
    },
    /// A tool call finished.
    ToolResult {
        /// The call id.
        id: String,
        /// The tool name.
        name: String,
        /// The result text.
        content: String,
        /// Whether the call failed.
        #[serde(rename = "isError")]
        is_error: bool,
        /// The plan step.
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
    },
    /// Assistant text. Streamed chunks have `complete` unset; the result of
    /// an intermediate plan step is reported once with `complete` set.
    AssistantMessage {
        /// The text.
        content: String,
        /// The plan step.
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
        /// Whether this is a whole step result rather than a chunk.
        complete: bool,
    },
    /// The plan the call is going to follow.
    Plan {
        /// The steps in order.
        steps: Vec<PlanStep>,
    },
    /// The call completed. Sent exactly once per successful call.
    FinalMessage {
        /// The final answer.
        message: String,
        /// How many tool calls were issued.
        #[serde(rename = "toolCallsUsed")]
        tool_calls_used: usize,
    },
}

pub(crate) fn emit(sink: Option<&EventSink>, event: AgentEvent) {
    if let Some(sink) = sink {
        if sink.send(event).is_err() {
            trace!("event sink detached, dropping event");
        }
    }
}
