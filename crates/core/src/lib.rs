//! Agent orchestration: pooled tool-provider connections, tool resolution,
//! planning and the model/tool round loop.
//!
//! The public entry point is [`Agent::chat`]. Everything else is exposed so
//! that hosts can plug in their own model resolvers, provider stores and
//! transports, or drive the pool directly.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod conversation;
mod error;
pub mod flow;
mod model_client;
pub mod planner;
pub mod pool;
pub mod provider;
#[cfg(test)]
mod testing;
pub mod tool;

pub use agent::{
    Agent, AgentBuilder, AgentChatResult, AgentEvent, ChatOptions,
    DEFAULT_SYSTEM_PROMPT, EventSink, ROUND_BUDGET_EXHAUSTED,
};
pub use error::{ConnectError, Error};
pub use model_client::{ModelClient, ModelClientResponse, ModelResolver};
