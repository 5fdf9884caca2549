//! Provider-neutral protocol between the agent and language models.
//!
//! The agent never talks to a concrete model API. It builds a
//! [`ModelRequest`] from its transcript and tool catalog, hands it to a
//! [`ModelProvider`], and consumes the streamed [`ModelResponseEvent`]s.
//! Adapters for real APIs live in their own crates.
//!
//! Nothing here performs I/O; the types only describe the contract that
//! implementors must follow.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
