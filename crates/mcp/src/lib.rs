//! Stdio transport for MCP tool providers.
//!
//! Each provider is a child process that speaks newline-delimited JSON-RPC
//! over its stdin and stdout. [`StdioTransport`] launches the process,
//! performs the `initialize` handshake and hands back a session that the
//! connection pool keeps alive.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod process;
mod protocol;
mod session;

use std::time::Duration;

use async_trait::async_trait;
use stepwise_core::provider::{
    ProviderSession, ProviderTransport, ToolProviderConfig, TransportError,
};

use session::McpSession;

/// Default time a provider has to answer a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Options shared by every session a [`StdioTransport`] opens.
#[derive(Clone, Debug)]
pub struct McpTransportConfig {
    request_timeout: Duration,
    client_name: String,
    client_version: String,
}

impl Default for McpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            client_name: "stepwise".to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

impl McpTransportConfig {
    /// Sets how long a request may wait for its response.
    #[inline]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the client name and version announced during the handshake.
    pub fn with_client_info<N, V>(mut self, name: N, version: V) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    /// The per-request timeout.
    #[inline]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Launches providers as local processes.
#[derive(Clone, Debug, Default)]
pub struct StdioTransport {
    config: McpTransportConfig,
}

impl StdioTransport {
    /// Creates a transport with the given options.
    #[inline]
    pub fn new(config: McpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProviderTransport for StdioTransport {
    async fn connect(
        &self,
        config: &ToolProviderConfig,
    ) -> Result<Box<dyn ProviderSession>, TransportError> {
        let session = McpSession::spawn(config, &self.config)?;
        if let Err(err) = session.initialize(&self.config).await {
            warn!("provider {} handshake failed: {err}", config.name);
            session.close().await;
            return Err(match err {
                TransportError::Handshake(_) => err,
                other => TransportError::Handshake(other.to_string()),
            });
        }
        Ok(Box::new(session))
    }
}
