//! Fixed tool pipelines: a graph of tool-call nodes executed in edge order
//! without involving the model.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::pool::Lease;
use crate::tool::ToolResolver;

/// The node type that denotes a tool call.
pub const TOOL_CALL_NODE: &str = "toolCall";

/// A graph of tool calls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    /// The nodes, in declaration order.
    pub nodes: Vec<FlowNode>,
    /// Ordering constraints between nodes.
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

/// One node of a [`FlowRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    /// Unique node id.
    pub id: String,
    /// The node type. Absent means a tool call.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// The call description.
    #[serde(default)]
    pub data: FlowNodeData,
}

/// The tool call of a [`FlowNode`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeData {
    /// The tool to call. Nodes without a name are skipped.
    #[serde(default)]
    pub name: Option<String>,
    /// The arguments, an empty object when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// `source` runs before `target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    /// Optional edge id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The node that runs first.
    pub source: String,
    /// The node that runs after.
    pub target: String,
}

/// The outcome of one executed node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNodeResult {
    /// The node id.
    pub node_id: String,
    /// The tool that ran.
    pub tool_name: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// The result text or the error description.
    pub output: String,
    /// Whether the call failed.
    pub is_error: bool,
}

/// The outcome of a whole flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    /// Results in execution order.
    pub results: Vec<FlowNodeResult>,
    /// How many tool calls ran.
    pub executed_count: usize,
}

impl FlowNode {
    fn tool_name(&self) -> Option<&str> {
        match self.kind.as_deref() {
            None | Some(TOOL_CALL_NODE) => self.data.name.as_deref(),
            Some(_) => None,
        }
    }
}

/// Orders node ids so that every edge source precedes its target.
///
/// Edges that mention unknown ids are ignored. Without edges, or when the
/// edges form a cycle, the given order is kept.
pub fn topological_order<'a>(ids: &[&'a str], edges: &[FlowEdge]) -> Vec<&'a str> {
    if edges.is_empty() {
        return ids.to_vec();
    }

    let mut in_degree: HashMap<&str, usize> =
        ids.iter().map(|id| (*id, 0)).collect();
    let mut out_edges: HashMap<&str, Vec<&'a str>> = HashMap::new();
    for edge in edges {
        let (Some(&source), Some(&target)) = (
            ids.iter().find(|id| **id == edge.source),
            ids.iter().find(|id| **id == edge.target),
        ) else {
            continue;
        };
        out_edges.entry(source).or_default().push(target);
        *in_degree.entry(target).or_default() += 1;
    }

    let mut queue: VecDeque<&'a str> = ids
        .iter()
        .copied()
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        for &next in out_edges.get(id).into_iter().flatten() {
            let degree = in_degree.entry(next).or_default();
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() == ids.len() {
        order
    } else {
        debug!("flow edges form a cycle, keeping node order");
        ids.to_vec()
    }
}

/// Executes the tool nodes of `request` one after another.
pub(crate) async fn run(
    resolver: &ToolResolver,
    lease: &Lease,
    request: &FlowRequest,
) -> FlowResult {
    let nodes: HashMap<&str, (&FlowNode, &str)> = request
        .nodes
        .iter()
        .filter_map(|node| Some((node.id.as_str(), (node, node.tool_name()?))))
        .collect();
    let ids: Vec<&str> = request
        .nodes
        .iter()
        .map(|node| node.id.as_str())
        .filter(|id| nodes.contains_key(id))
        .collect();

    let mut results = Vec::with_capacity(ids.len());
    for id in topological_order(&ids, &request.edges) {
        let (node, tool_name) = nodes[id];
        let args = node.data.args.clone().unwrap_or_else(|| json!({}));
        let output = resolver.call(lease, tool_name, args).await;
        results.push(FlowNodeResult {
            node_id: node.id.clone(),
            tool_name: tool_name.to_owned(),
            success: !output.is_error,
            output: output.text,
            is_error: output.is_error,
        });
    }
    FlowResult {
        executed_count: results.len(),
        results,
    }
}
