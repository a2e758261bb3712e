use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use quire_core::{
    BlockDelta, BlockType, GenerateRequest, LlmProvider, ProviderError, ProviderEvent, ProviderStream, StopReason,
    StreamMetadata,
};

/// Scripted response for one `stream_response` call.
pub enum MockResponse {
    /// Yield these events back to back.
    Stream(Vec<ProviderEvent>),
    /// Yield these events with a pause before each one.
    Paced(Duration, Vec<ProviderEvent>),
    /// Yield whatever the paired [`LiveFeed`] sends until it is dropped.
    Live(mpsc::Receiver<ProviderEvent>),
    /// Fail the `stream_response` call itself.
    Error(ProviderError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A single text block followed by `end_turn` metadata.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            ProviderEvent::Delta(BlockDelta::text(0, text).with_block_type(BlockType::Text)),
            ProviderEvent::Metadata(mock_metadata(StopReason::EndTurn)),
        ])
    }

    /// A stream that fails in-band after `deltas`.
    pub fn failing_after(deltas: Vec<BlockDelta>, error: ProviderError) -> Self {
        let mut events: Vec<ProviderEvent> = deltas.into_iter().map(ProviderEvent::Delta).collect();
        events.push(ProviderEvent::Error(error));
        Self::Stream(events)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Metadata as the mock reports it on completion.
pub fn mock_metadata(stop_reason: StopReason) -> StreamMetadata {
    StreamMetadata {
        model: "mock-model".into(),
        input_tokens: 10,
        output_tokens: 20,
        stop_reason,
        response_metadata: Some(serde_json::json!({ "mock": true })),
    }
}

/// Sending half of a [`MockResponse::Live`] stream, driven by the test.
#[derive(Clone)]
pub struct LiveFeed {
    tx: mpsc::Sender<ProviderEvent>,
}

impl LiveFeed {
    pub async fn delta(&self, delta: BlockDelta) {
        let _ = self.tx.send(ProviderEvent::Delta(delta)).await;
    }

    pub async fn finish(&self, metadata: StreamMetadata) {
        let _ = self.tx.send(ProviderEvent::Metadata(metadata)).await;
    }

    pub async fn fail(&self, error: ProviderError) {
        let _ = self.tx.send(ProviderEvent::Error(error)).await;
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Provider returning scripted responses in call order, for tests.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider whose single response is fed live through the returned handle.
    pub fn live() -> (Self, LiveFeed) {
        let (tx, rx) = mpsc::channel(64);
        (Self::new(vec![MockResponse::Live(rx)]), LiveFeed { tx })
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn stream_response(
        &self,
        request: GenerateRequest,
        _cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request);
            requests.len()
        };
        let response = self.responses.lock().pop_front().ok_or_else(|| {
            ProviderError::InvalidRequest(format!("MockProvider: no response configured for call {call}"))
        })?;
        resolve_response(response).await
    }
}

async fn resolve_response(mut current: MockResponse) -> Result<ProviderStream, ProviderError> {
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Paced(interval, events) => {
                let paced = stream::unfold(VecDeque::from(events), move |mut pending| async move {
                    let next = pending.pop_front()?;
                    tokio::time::sleep(interval).await;
                    Some((next, pending))
                });
                return Ok(Box::pin(paced));
            }
            MockResponse::Live(rx) => return Ok(Box::pin(ReceiverStream::new(rx))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
