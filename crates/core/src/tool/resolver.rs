use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::{Value, json};
use tracing::Instrument;

use super::{Error, ToolOutput};
use crate::pool::{Lease, LiveProvider};
use crate::provider::ContentPart;

/// Maps tool names to providers and executes calls.
///
/// The name to provider memo is filled lazily and shared by every call made
/// through the same resolver. It is never invalidated: a memoized provider
/// is used as long as it is part of the leased set.
#[derive(Debug, Default)]
pub struct ToolResolver {
    memo: Mutex<HashMap<String, String>>,
}

impl ToolResolver {
    /// Creates a resolver with an empty memo.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the provider serving `name` among the leased providers, first
    /// in order wins.
    pub fn resolve<'a>(
        &self,
        lease: &'a Lease,
        name: &str,
    ) -> Option<&'a LiveProvider> {
        let memoized = self.memo().get(name).cloned();
        if let Some(id) = memoized {
            if let Some(provider) =
                lease.providers().find(|p| p.config().id == id)
            {
                return Some(provider);
            }
        }

        let provider = lease.providers().find(|p| p.serves(name))?;
        trace!("resolved {name} to {}", provider.config().id);
        self.memo()
            .insert(name.to_owned(), provider.config().id.clone());
        Some(provider)
    }

    /// Calls a tool on the given provider. Never fails: transport errors and
    /// provider-reported failures come back as flagged outputs.
    pub async fn invoke(
        &self,
        provider: &LiveProvider,
        name: &str,
        arguments: Value,
    ) -> ToolOutput {
        let arguments = match arguments {
            Value::Null => json!({}),
            arguments => arguments,
        };
        let span = debug_span!("tool call", tool = name, provider = %provider.config().id);
        let result = provider
            .session()
            .call_tool(name, arguments)
            .instrument(span)
            .await;

        match result {
            Ok(output) => {
                let text = join_text(&output.content);
                if !output.is_error {
                    ToolOutput::success(text)
                } else if text.is_empty() {
                    Error::execution().into()
                } else {
                    Error::execution().with_reason(text).into()
                }
            }
            Err(err) => {
                warn!("tool {name} failed: {err}");
                Error::from(err).into()
            }
        }
    }

    /// Resolves and invokes in one go. An unknown tool yields a flagged
    /// output instead of an error.
    pub async fn call(
        &self,
        lease: &Lease,
        name: &str,
        arguments: Value,
    ) -> ToolOutput {
        match self.resolve(lease, name) {
            Some(provider) => self.invoke(provider, name, arguments).await,
            None => {
                debug!("no provider serves {name}");
                Error::unresolved(name).into()
            }
        }
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Joins the text parts of a result. Other parts are dropped.
fn join_text(content: &[ContentPart]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text(text) => Some(text.as_str()),
            ContentPart::Image { .. } | ContentPart::Resource { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::provider::{CallToolOutput, TransportError};
    use crate::testing::FakeTransport;

    fn pool(transport: &FakeTransport) -> ConnectionPool {
        ConnectionPool::new(transport.clone(), PoolConfig::default())
    }

    #[tokio::test]
    async fn test_first_provider_in_order_wins() {
        let transport = FakeTransport::default();
        let a = transport.add_provider("a", &["search"]);
        let b = transport.add_provider("b", &["search", "fetch"]);
        let pool = pool(&transport);
        let resolver = ToolResolver::new();

        let lease = pool.acquire(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(resolver.resolve(&lease, "search").unwrap().config().id, "a");
        assert_eq!(resolver.resolve(&lease, "fetch").unwrap().config().id, "b");
        assert!(resolver.resolve(&lease, "missing").is_none());

        // The memo points at `a`, which is not part of this set.
        let only_b = pool.acquire(&[b]).await.unwrap();
        assert_eq!(resolver.resolve(&only_b, "search").unwrap().config().id, "b");
    }

    #[tokio::test]
    async fn test_memo_survives_reordering() {
        let transport = FakeTransport::default();
        let a = transport.add_provider("a", &["search"]);
        let b = transport.add_provider("b", &["search"]);
        let pool = pool(&transport);
        let resolver = ToolResolver::new();

        let lease = pool.acquire(&[a.clone(), b.clone()]).await.unwrap();
        resolver.resolve(&lease, "search").unwrap();

        let reordered = pool.acquire(&[b, a]).await.unwrap();
        assert_eq!(
            resolver.resolve(&reordered, "search").unwrap().config().id,
            "a"
        );
    }

    #[tokio::test]
    async fn test_unresolved_tool() {
        let transport = FakeTransport::default();
        let pool = pool(&transport);
        let lease = pool.acquire(&[]).await.unwrap();

        let output = ToolResolver::new()
            .call(&lease, "delete_everything", json!({}))
            .await;
        assert!(output.is_error);
        assert_eq!(output.text, "no provider serves tool delete_everything");
    }

    #[tokio::test]
    async fn test_failures_are_absorbed() {
        let transport = FakeTransport::default();
        let fs = transport.add_provider("fs", &["read_file", "stat"]);
        transport.set_result("fs", "read_file", Err(TransportError::Timeout));
        transport.set_result(
            "fs",
            "stat",
            Ok(CallToolOutput {
                content: vec![ContentPart::Text("no such file".to_owned())],
                is_error: true,
            }),
        );
        let pool = pool(&transport);
        let lease = pool.acquire(&[fs]).await.unwrap();
        let resolver = ToolResolver::new();

        let output = resolver.call(&lease, "read_file", Value::Null).await;
        assert!(output.is_error);
        assert_eq!(output.text, "request timed out");

        let output = resolver.call(&lease, "stat", json!({"path": "x"})).await;
        assert_eq!(
            output,
            ToolOutput::from(Error::execution().with_reason("no such file"))
        );
    }

    #[tokio::test]
    async fn test_joins_text_parts() {
        let transport = FakeTransport::default();
        let fs = transport.add_provider("fs", &["ls"]);
        transport.set_result(
            "fs",
            "ls",
            Ok(CallToolOutput {
                content: vec![
                    ContentPart::Text("a.txt".to_owned()),
                    ContentPart::Image {
                        mime_type: "image/png".to_owned(),
                    },
                    ContentPart::Resource {
                        uri: "file:///c.txt".to_owned(),
                        text: Some("inline".to_owned()),
                    },
                    ContentPart::Text("b.txt".to_owned()),
                ],
                is_error: false,
            }),
        );
        let pool = pool(&transport);
        let lease = pool.acquire(&[fs]).await.unwrap();

        let output = ToolResolver::new().call(&lease, "ls", Value::Null).await;
        assert_eq!(output, ToolOutput::success("a.txt\nb.txt"));
        // Null arguments are sent as an empty object.
        assert_eq!(transport.calls()[0].2, json!({}));
    }
}
