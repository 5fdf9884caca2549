//! A scripted provider transport for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::provider::{
    CallToolOutput, ProviderSession, ProviderTransport, ToolDescriptor,
    ToolProviderConfig, TransportError,
};

#[derive(Default)]
struct FakeProvider {
    tools: Vec<ToolDescriptor>,
    results: HashMap<String, Result<CallToolOutput, TransportError>>,
    refuse: bool,
    /// Bumped by a crash, sessions of older generations are dead.
    generation: usize,
}

#[derive(Default)]
struct Inner {
    providers: Mutex<HashMap<String, FakeProvider>>,
    calls: Mutex<Vec<(String, String, Value)>>,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// Serves providers registered with [`FakeTransport::add_provider`].
///
/// Clones share the registry and the counters.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    inner: Arc<Inner>,
}

impl FakeTransport {
    /// Registers a provider serving `tools` and returns its config.
    pub fn add_provider(&self, id: &str, tools: &[&str]) -> ToolProviderConfig {
        let tools = tools
            .iter()
            .map(|name| {
                ToolDescriptor::new(*name).with_description(format!("{name} tool"))
            })
            .collect();
        self.inner.providers.lock().unwrap().insert(
            id.to_owned(),
            FakeProvider {
                tools,
                ..Default::default()
            },
        );
        ToolProviderConfig::new(id, format!("fake-{id}"))
    }

    /// Sets what calling `tool` on provider `id` returns.
    pub fn set_result(
        &self,
        id: &str,
        tool: &str,
        result: Result<CallToolOutput, TransportError>,
    ) {
        let mut providers = self.inner.providers.lock().unwrap();
        let provider = providers.get_mut(id).expect("unknown fake provider");
        provider.results.insert(tool.to_owned(), result);
    }

    /// Makes every connect to provider `id` fail.
    pub fn refuse(&self, id: &str) {
        let mut providers = self.inner.providers.lock().unwrap();
        providers.get_mut(id).expect("unknown fake provider").refuse = true;
    }

    /// Kills every session currently open to provider `id`, as if its
    /// process exited. Later connects work again.
    pub fn crash(&self, id: &str) {
        let mut providers = self.inner.providers.lock().unwrap();
        providers.get_mut(id).expect("unknown fake provider").generation += 1;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Every tool call received so far as `(provider, tool, arguments)`.
    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.inner.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderTransport for FakeTransport {
    async fn connect(
        &self,
        config: &ToolProviderConfig,
    ) -> Result<Box<dyn ProviderSession>, TransportError> {
        let delay = *self.inner.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let generation = match self.inner.providers.lock().unwrap().get(&config.id) {
            Some(provider) if !provider.refuse => Some(provider.generation),
            _ => None,
        };
        let Some(generation) = generation else {
            return Err(TransportError::Launch(format!(
                "{} refused to start",
                config.command
            )));
        };
        Ok(Box::new(FakeSession {
            id: config.id.clone(),
            generation,
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeSession {
    id: String,
    generation: usize,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

#[async_trait]
impl ProviderSession for FakeSession {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let providers = self.inner.providers.lock().unwrap();
        Ok(providers[&self.id].tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolOutput, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner.calls.lock().unwrap().push((
            self.id.clone(),
            name.to_owned(),
            arguments,
        ));
        let providers = self.inner.providers.lock().unwrap();
        match providers[&self.id].results.get(name) {
            Some(result) => result.clone(),
            None => Ok(CallToolOutput::text(format!("{name} done"))),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let providers = self.inner.providers.lock().unwrap();
        providers[&self.id].generation != self.generation
    }
}
