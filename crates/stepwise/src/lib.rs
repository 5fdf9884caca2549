//! An out-of-the-box agent that wires the OpenAI-compatible model provider
//! and stdio tool providers into the `stepwise` orchestrator.
//!
//! The crate includes a CLI tool for using in the terminal. And you can also
//! use it as a library to bring agent functionality into your own host apps.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

pub mod config;
mod session;

pub use config::{ConfigError, EndpointResolver, Settings};
pub use session::{Session, SessionBuilder};

/// Re-exports of [`stepwise_core`] crate.
pub mod core {
    pub use stepwise_core::*;
}
