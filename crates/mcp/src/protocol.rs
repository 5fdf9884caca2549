//! JSON-RPC 2.0 framing and the subset of MCP messages the client uses.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_core::provider::{CallToolOutput, ContentPart, ToolDescriptor};

pub(crate) const PROTOCOL_VERSION: &str = "2024-11-05";
const JSONRPC: &str = "2.0";

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str) -> Self {
        Self {
            jsonrpc: JSONRPC,
            method,
        }
    }
}

/// Anything the server writes: a response, a notification or a request.
#[derive(Debug, Deserialize)]
pub(crate) struct Incoming {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Incoming {
    /// The id of a response to one of our requests.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_u64)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeParams<'a> {
    pub protocol_version: &'static str,
    pub capabilities: Value,
    pub client_info: ClientInfo<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ClientInfo<'a> {
    pub name: &'a str,
    pub version: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolsListResult {
    pub tools: Vec<ToolDef>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

impl From<ToolDef> for ToolDescriptor {
    fn from(def: ToolDef) -> Self {
        let mut descriptor = ToolDescriptor::new(def.name);
        if let Some(description) = def.description {
            descriptor = descriptor.with_description(description);
        }
        if let Some(schema) = def.input_schema {
            descriptor = descriptor.with_input_schema(schema);
        }
        descriptor
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ToolCallParams<'a> {
    pub name: &'a str,
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum Content {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: EmbeddedResource,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddedResource {
    pub uri: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl From<ToolCallResult> for CallToolOutput {
    fn from(result: ToolCallResult) -> Self {
        let content = result
            .content
            .into_iter()
            .filter_map(|part| match part {
                Content::Text { text } => Some(ContentPart::Text(text)),
                Content::Image { mime_type } => {
                    Some(ContentPart::Image { mime_type })
                }
                Content::Resource { resource } => Some(ContentPart::Resource {
                    uri: resource.uri,
                    text: resource.text,
                }),
                Content::Unsupported => None,
            })
            .collect();
        Self {
            content,
            is_error: result.is_error,
        }
    }
}
