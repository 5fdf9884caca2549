//! A JSON-RPC session with one stdio provider.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stepwise_core::provider::{
    CallToolOutput, ProviderSession, ToolDescriptor, ToolProviderConfig,
    TransportError,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;

use crate::McpTransportConfig;
use crate::process;
use crate::protocol::{
    ClientInfo, Incoming, InitializeParams, InitializeResult, Notification,
    PROTOCOL_VERSION, Request, ToolCallParams, ToolCallResult, ToolsListResult,
};

const EXIT_GRACE: Duration = Duration::from_secs(2);

type Reply = oneshot::Sender<Result<Value, TransportError>>;

/// Requests waiting for a response. `None` once the connection is gone, so
/// late requests fail instead of waiting for their timeout.
struct Pending(Mutex<Option<HashMap<u64, Reply>>>);

impl Pending {
    fn open() -> Self {
        Self(Mutex::new(Some(HashMap::new())))
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<u64, Reply>>> {
        self.0.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn register(&self, id: u64, reply: Reply) -> Result<(), TransportError> {
        match self.lock().as_mut() {
            Some(map) => {
                map.insert(id, reply);
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    fn take(&self, id: u64) -> Option<Reply> {
        self.lock().as_mut().and_then(|map| map.remove(&id))
    }

    fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn fail_all(&self) {
        let drained = self.lock().take();
        for (_, reply) in drained.into_iter().flatten() {
            reply.send(Err(TransportError::Closed)).ok();
        }
    }
}

pub(crate) struct McpSession {
    name: String,
    timeout: Duration,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    child: AsyncMutex<Option<Child>>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl McpSession {
    pub fn spawn(
        config: &ToolProviderConfig,
        transport: &McpTransportConfig,
    ) -> Result<Self, TransportError> {
        let process = process::spawn(config)?;
        let pending = Arc::new(Pending::open());
        let reader = tokio::spawn(receive_loop(
            config.name.clone(),
            process.stdout,
            Arc::clone(&pending),
        ));
        Ok(Self {
            name: config.name.clone(),
            timeout: transport.request_timeout,
            next_id: AtomicU64::new(1),
            pending,
            stdin: AsyncMutex::new(Some(process.stdin)),
            child: AsyncMutex::new(Some(process.child)),
            reader,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn initialize(
        &self,
        transport: &McpTransportConfig,
    ) -> Result<(), TransportError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            capabilities: json!({}),
            client_info: ClientInfo {
                name: &transport.client_name,
                version: &transport.client_version,
            },
        };
        let params = serde_json::to_value(params)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let result: InitializeResult =
            self.request("initialize", Some(params)).await?;

        match &result.server_info {
            Some(info) => info!(
                "provider {} is {} {} (protocol {})",
                self.name,
                info.name,
                info.version.as_deref().unwrap_or("?"),
                result.protocol_version
            ),
            None => info!(
                "provider {} initialized (protocol {})",
                self.name, result.protocol_version
            ),
        }

        self.notify("notifications/initialized").await
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.register(id, tx)?;

        let message = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        debug!("provider {} request [{id}]: {method}", self.name);
        if let Err(err) = self.send(&message).await {
            self.pending.take(id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => serde_json::from_value(value).map_err(|err| {
                TransportError::Protocol(format!("invalid {method} result: {err}"))
            }),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.take(id);
                warn!("provider {} timed out on {method}", self.name);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let message = serde_json::to_string(&Notification::new(method))
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.send(&message).await
    }

    async fn send(&self, message: &str) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(TransportError::Closed);
        };
        write_line(stdin, message).await.map_err(|err| {
            debug!("provider {} write failed: {err}", self.name);
            TransportError::Closed
        })
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &str) -> io::Result<()> {
    stdin.write_all(message.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

#[async_trait]
impl ProviderSession for McpSession {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|cursor| json!({ "cursor": cursor }));
            let page: ToolsListResult = self.request("tools/list", params).await?;
            tools.extend(page.tools.into_iter().map(ToolDescriptor::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        info!("provider {} serves {} tools", self.name, tools.len());
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolOutput, TransportError> {
        let params = serde_json::to_value(ToolCallParams { name, arguments })
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let result: ToolCallResult = self.request("tools/call", Some(params)).await?;
        Ok(result.into())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing provider {}", self.name);

        // Dropping stdin is the polite shutdown signal for stdio servers.
        self.stdin.lock().await.take();
        self.pending.fail_all();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("provider {} exited with {status}", self.name),
                Ok(Err(err)) => warn!("provider {} wait failed: {err}", self.name),
                Err(_) => {
                    warn!("provider {} did not exit, killing it", self.name);
                    child.kill().await.ok();
                }
            }
        }
        self.reader.abort();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.pending.is_closed()
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn receive_loop(name: String, stdout: ChildStdout, pending: Arc<Pending>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("provider {name} closed its output");
                break;
            }
            Err(err) => {
                warn!("provider {name} read failed: {err}");
                break;
            }
        };

        let line = line.trim();
        if !line.starts_with('{') {
            if !line.is_empty() {
                debug!("provider {name} skipped non-JSON line: {line}");
            }
            continue;
        }

        let incoming: Incoming = match serde_json::from_str(line) {
            Ok(incoming) => incoming,
            Err(err) => {
                warn!("provider {name} sent a malformed message: {err}");
                continue;
            }
        };
        dispatch(&name, incoming, &pending);
    }
    pending.fail_all();
}

fn dispatch(name: &str, incoming: Incoming, pending: &Pending) {
    let Some(id) = incoming.response_id() else {
        if let Some(method) = &incoming.method {
            debug!("provider {name} sent {method}, ignored");
        }
        return;
    };
    let Some(reply) = pending.take(id) else {
        debug!("provider {name} answered unknown request {id}");
        return;
    };
    let result = match incoming.error {
        Some(err) => Err(TransportError::Remote {
            code: err.code,
            message: err.message,
        }),
        None => Ok(incoming.result.unwrap_or(Value::Null)),
    };
    reply.send(result).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_routes_by_id() {
        let pending = Pending::open();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.register(1, tx1).unwrap();
        pending.register(2, tx2).unwrap();

        let ok: Incoming =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":2,"result":{"x":1}}"#)
                .unwrap();
        dispatch("p", ok, &pending);
        assert_eq!(rx2.try_recv().unwrap().unwrap(), json!({"x": 1}));

        let err: Incoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-1,"message":"bad"}}"#,
        )
        .unwrap();
        dispatch("p", err, &pending);
        assert_eq!(
            rx1.try_recv().unwrap().unwrap_err(),
            TransportError::Remote {
                code: -1,
                message: "bad".to_owned()
            }
        );
    }

    #[test]
    fn test_closed_pending_refuses() {
        let pending = Pending::open();
        assert!(!pending.is_closed());
        let (tx, mut rx) = oneshot::channel();
        pending.register(1, tx).unwrap();
        pending.fail_all();
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), TransportError::Closed);

        let (tx, _rx) = oneshot::channel();
        assert_eq!(pending.register(2, tx), Err(TransportError::Closed));
        assert!(pending.is_closed());
    }
}
