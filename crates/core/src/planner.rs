//! Best-effort decomposition of a request into ordered steps.

use std::fmt::Write;

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use stepwise_model::{ModelMessage, ModelRequest, ResponseFormat, ToolChoice};

use crate::conversation::ConversationMessage;
use crate::model_client::ModelClient;
use crate::pool::Lease;

/// One unit of a decomposed task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlanStep {
    /// What this step must achieve.
    pub description: String,
    /// The provider this step is pinned to, by id or name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

impl PlanStep {
    /// Creates an unpinned step.
    #[inline]
    pub fn new<S: Into<String>>(description: S) -> Self {
        Self {
            description: description.into(),
            server: None,
        }
    }

    /// Pins the step to a provider.
    #[inline]
    pub fn pinned<S: Into<String>>(mut self, server: S) -> Self {
        self.server = Some(server.into());
        self
    }
}

/// An ordered list of steps. Once created it is never reordered or
/// modified; an empty plan means the request is handled in one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    /// Creates a plan from steps.
    #[inline]
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// The steps in execution order.
    #[inline]
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Whether there is nothing to plan.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// What the planning call must answer with.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct PlannerOutput {
    /// Whether the request needs more than one step.
    #[serde(default)]
    need_plan: bool,
    /// The steps, in order.
    #[serde(default)]
    steps: Vec<StepSpec>,
}

/// A step given either as a bare description or as an object.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(untagged)]
enum StepSpec {
    Text(String),
    Step(PlanStep),
}

const PLANNER_PROMPT: &str = "\
You decide whether the user's latest request needs several ordered steps. \
Reply with a single JSON object matching this JSON schema and nothing else:";

const PLANNER_GUIDE: &str = "\
Set needPlan to false when one answer, or one round of tool calls, is \
enough. Otherwise list the steps in the order they must run. When a step \
can only be done with one provider, set its server to that provider's name.";

/// Classifies requests as simple or multi-step.
#[derive(Clone, Debug)]
pub struct Planner {
    max_steps: usize,
    max_tokens: u32,
}

impl Default for Planner {
    fn default() -> Self {
        Self {
            max_steps: 8,
            max_tokens: 1024,
        }
    }
}

impl Planner {
    /// Caps the number of steps kept from a plan.
    #[inline]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Caps the size of the planning reply.
    #[inline]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Asks the model for a plan. Any failure degrades to an empty plan.
    pub async fn classify(
        &self,
        model: &ModelClient,
        conversation: &[ConversationMessage],
        lease: &Lease,
    ) -> Plan {
        let req = self.build_request(conversation, lease);
        match model.send_request(req, |_| {}).await {
            Ok(resp) => self.parse(&resp.text),
            Err(err) => {
                warn!("planning failed, continuing without a plan: {err}");
                Plan::default()
            }
        }
    }

    fn build_request(
        &self,
        conversation: &[ConversationMessage],
        lease: &Lease,
    ) -> ModelRequest {
        let schema = schema_for!(PlannerOutput).to_value();
        let mut prompt = format!("{PLANNER_PROMPT}\n{schema}\n\n{PLANNER_GUIDE}");
        prompt.push_str("\n\nAvailable providers:");
        for provider in lease.providers() {
            let tools: Vec<_> =
                provider.tools().iter().map(|t| t.name.as_str()).collect();
            write!(prompt, "\n- {}: {}", provider.config().name, tools.join(", "))
                .ok();
        }

        let mut messages = vec![ModelMessage::System(prompt)];
        messages.extend(
            conversation
                .iter()
                .map(ConversationMessage::to_model_message),
        );
        ModelRequest {
            messages,
            tools: vec![],
            tool_choice: ToolChoice::None,
            response_format: ResponseFormat::JsonObject,
            max_tokens: Some(self.max_tokens),
        }
    }

    fn parse(&self, text: &str) -> Plan {
        let Some(json) = extract_object(text) else {
            debug!("planner reply holds no JSON object: {text:?}");
            return Plan::default();
        };
        let output: PlannerOutput = match serde_json::from_str(json) {
            Ok(output) => output,
            Err(err) => {
                debug!("malformed planner reply: {err}");
                return Plan::default();
            }
        };
        if !output.need_plan {
            return Plan::default();
        }

        let steps: Vec<_> = output
            .steps
            .into_iter()
            .map(|spec| match spec {
                StepSpec::Text(description) => PlanStep::new(description),
                StepSpec::Step(step) => step,
            })
            .map(|mut step| {
                step.description = step.description.trim().to_owned();
                step.server = step
                    .server
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty());
                step
            })
            .filter(|step| !step.description.is_empty())
            .take(self.max_steps)
            .collect();
        debug!("planned {} steps", steps.len());
        Plan::new(steps)
    }
}

/// Returns the span from the first `{` to the last `}`, which also strips
/// markdown fences around the object.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use stepwise_test_model::{PresetResponse, TestModelProvider};

    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::testing::FakeTransport;

    #[test]
    fn test_parse_steps() {
        let planner = Planner::default();
        let plan = planner.parse(
            r#"{"needPlan": true, "steps": [
                "search files",
                {"description": "summarize", "server": "notes"},
                {"description": "  ", "server": "x"},
                {"description": "report", "server": ""}
            ]}"#,
        );
        assert_eq!(
            plan.steps(),
            [
                PlanStep::new("search files"),
                PlanStep::new("summarize").pinned("notes"),
                PlanStep::new("report"),
            ]
        );
    }

    #[test]
    fn test_parse_fenced_reply() {
        let plan = Planner::default().parse(
            "Sure!\n```json\n{\"needPlan\": true, \"steps\": [\"a\", \"b\"]}\n```",
        );
        assert_eq!(plan.steps().len(), 2);
    }

    #[test]
    fn test_parse_degrades_to_no_plan() {
        let planner = Planner::default();
        assert!(planner.parse("I cannot plan this").is_empty());
        assert!(planner.parse("{\"needPlan\": \"maybe\"}").is_empty());
        assert!(planner.parse("} {").is_empty());
        assert!(
            planner
                .parse(r#"{"needPlan": false, "steps": ["a", "b"]}"#)
                .is_empty()
        );
    }

    #[test]
    fn test_parse_truncates() {
        let plan = Planner::default()
            .with_max_steps(2)
            .parse(r#"{"needPlan": true, "steps": ["a", "b", "c"]}"#);
        assert_eq!(plan.steps().len(), 2);
    }

    #[tokio::test]
    async fn test_classify_request_shape() {
        let transport = FakeTransport::default();
        let notes = transport
            .add_provider("notes", &["write_note"])
            .with_name("Notes");
        let pool = ConnectionPool::new(transport, PoolConfig::default());
        let lease = pool.acquire(&[notes]).await.unwrap();

        let provider = TestModelProvider::default();
        provider.add_response(PresetResponse::text(
            r#"{"needPlan": true, "steps": ["search", "summarize"]}"#,
        ));
        let model = ModelClient::new(provider.clone());

        let plan = Planner::default()
            .classify(&model, &[ConversationMessage::user("research x")], &lease)
            .await;
        assert_eq!(plan.steps().len(), 2);

        let req = &provider.requests()[0];
        assert!(req.tools.is_empty());
        assert_eq!(req.tool_choice, ToolChoice::None);
        assert_eq!(req.response_format, ResponseFormat::JsonObject);
        assert_eq!(req.max_tokens, Some(1024));
        assert!(req.messages[0].text().contains("- Notes: write_note"));
        assert!(req.messages[0].text().contains("needPlan"));
        assert_eq!(req.messages[1].text(), "research x");
    }

    #[tokio::test]
    async fn test_model_error_means_no_plan() {
        let pool =
            ConnectionPool::new(FakeTransport::default(), PoolConfig::default());
        let lease = pool.acquire(&[]).await.unwrap();
        let model = ModelClient::new(TestModelProvider::default());

        let plan = Planner::default()
            .classify(&model, &[ConversationMessage::user("hi")], &lease)
            .await;
        assert!(plan.is_empty());
    }
}
