//! Tool resolution and invocation.

mod error;
mod resolver;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{Error, ErrorKind};
pub use resolver::ToolResolver;

/// The model-visible outcome of one tool call.
///
/// Tool failures are values: they are shown to the model so it can adapt,
/// they never abort the round loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    /// The result text, or the failure description.
    pub text: String,
    /// Whether the call failed.
    pub is_error: bool,
}

impl ToolOutput {
    /// A successful output.
    #[inline]
    pub fn success<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }
}

impl From<Error> for ToolOutput {
    fn from(err: Error) -> Self {
        Self {
            text: err.reason().into_owned(),
            is_error: true,
        }
    }
}

/// One tool call issued during a chat call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// The tool name.
    pub name: String,
    /// The arguments the model passed.
    pub arguments: Value,
}
