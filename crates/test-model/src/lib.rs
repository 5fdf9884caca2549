//! A scripted in-process model for tests.
//!
//! Replies are consumed from a queue in the order they were added, so a test
//! describes a whole conversation up front and then inspects the requests
//! the agent actually sent.

mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use stepwise_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: VecDeque<ModelResponseEvent>,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl TestModelResponse {
    fn from_preset(preset: PresetResponse, delay: Duration) -> Self {
        let finish_reason = if preset.has_tool_call() {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        };
        let mut events: VecDeque<_> = preset
            .events
            .into_iter()
            .map(|event| match event {
                PresetEvent::MessageDelta(msg) => {
                    ModelResponseEvent::MessageDelta(msg)
                }
                PresetEvent::ToolCall(req) => ModelResponseEvent::ToolCall(req),
            })
            .collect();
        events.push_back(ModelResponseEvent::Completed(finish_reason));
        Self {
            events,
            delay,
            sleep: None,
        }
    }
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        if this.events.is_empty() {
            return Poll::Ready(Ok(None));
        }

        // Every event is delivered after one delay tick, so the consumer
        // observes a real suspension point between chunks.
        let delay = this.delay;
        let sleep = this.sleep.get_or_insert_with(|| Box::pin(sleep(delay)));
        ready!(sleep.as_mut().poll(cx));
        this.sleep = None;
        Poll::Ready(Ok(this.events.pop_front()))
    }
}

#[derive(Default)]
struct Script {
    queue: VecDeque<PresetResponse>,
    fallback: Option<PresetResponse>,
    requests: Vec<ModelRequest>,
}

/// A local fake model for testing purpose.
///
/// Each request takes the next queued [`PresetResponse`]. When the queue is
/// empty the fallback response (if any) is served again and again; without a
/// fallback the request fails. Clones share the same script.
///
/// # Note
///
/// This type is not optimized for production use, every request is copied
/// into the recorded history. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    /// Queues a reply.
    #[inline]
    pub fn add_response(&self, preset: PresetResponse) {
        self.lock().queue.push_back(preset);
    }

    /// Sets the reply served once the queue is exhausted.
    #[inline]
    pub fn set_fallback(&self, preset: PresetResponse) {
        self.lock().fallback = Some(preset);
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns every request received so far, oldest first.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    /// Returns how many requests were received so far.
    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    fn next_response(&self, req: &ModelRequest) -> Result<PresetResponse, Error> {
        let mut script = self.lock();
        script.requests.push(req.clone());

        if let Some(front) = script.queue.front_mut() {
            match front.failures {
                Some(0) => {
                    return Err(Error {
                        message: "preset always fails",
                        kind: ErrorKind::Other,
                    });
                }
                Some(n) => {
                    front.failures = (n > 1).then(|| n - 1);
                    return Err(Error {
                        message: "preset failure",
                        kind: ErrorKind::Other,
                    });
                }
                None => {}
            }
        }

        let next = script.queue.pop_front().or_else(|| script.fallback.clone());
        next.ok_or(Error {
            message: "no enough steps",
            kind: ErrorKind::RateLimitExceeded,
        })
    }

    #[inline]
    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("script lock poisoned")
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let delay = self.delay.unwrap_or(Duration::from_millis(1));
        let result = self
            .next_response(req)
            .map(|preset| TestModelResponse::from_preset(preset, delay));
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use serde_json::json;
    use stepwise_model::{ModelMessage, ToolCallRequest};

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> (String, Vec<ToolCallRequest>, Option<ModelFinishReason>) {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut tool_calls = vec![];
        let mut finish_reason = None;
        while let Some(event) =
            poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await.unwrap()
        {
            match event {
                ModelResponseEvent::Completed(reason) => {
                    finish_reason = Some(reason)
                }
                ModelResponseEvent::MessageDelta(delta) => {
                    msg.push_str(&delta);
                }
                ModelResponseEvent::ToolCall(req) => tool_calls.push(req),
            }
        }
        (msg, tool_calls, finish_reason)
    }

    fn user_request(text: &str) -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::User(text.to_owned())],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replies_in_order() {
        let provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("Hello, ".to_owned()),
            PresetEvent::MessageDelta("world!".to_owned()),
        ]));
        provider.add_response(PresetResponse::tool_call(
            "call_1",
            "read_file",
            json!({ "filename": "todo.txt" }),
        ));

        let resp = provider.send_request(&user_request("Hi")).await.unwrap();
        let (msg, calls, reason) = collect_response(resp).await;
        assert_eq!(msg, "Hello, world!");
        assert!(calls.is_empty());
        assert_eq!(reason, Some(ModelFinishReason::Stop));

        let resp = provider
            .send_request(&user_request("Check my todo"))
            .await
            .unwrap();
        let (_, calls, reason) = collect_response(resp).await;
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(reason, Some(ModelFinishReason::ToolCalls));

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages[0].text(), "Check my todo");
    }

    #[tokio::test]
    async fn test_fallback_repeats() {
        let provider = TestModelProvider::default();
        provider.set_fallback(PresetResponse::text("again"));
        for _ in 0..3 {
            let resp = provider.send_request(&user_request("x")).await.unwrap();
            assert_eq!(collect_response(resp).await.0, "again");
        }
        assert_eq!(provider.request_count(), 3);
    }

    #[tokio::test]
    async fn test_failures() {
        let provider = TestModelProvider::default();
        provider.add_response(PresetResponse::text("ok").with_failures(2));

        for _ in 0..2 {
            assert!(provider.send_request(&user_request("x")).await.is_err());
        }
        let resp = provider.send_request(&user_request("x")).await.unwrap();
        assert_eq!(collect_response(resp).await.0, "ok");

        let err = provider.send_request(&user_request("x")).await.err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::RateLimitExceeded));
    }
}
