use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use quire_core::{
    BlockDelta, ClientId, GenerateRequest, LlmProvider, ProviderEvent, StreamMetadata, TurnEvent, TurnId, TurnStatus,
};
use quire_store::TurnRepository;

use crate::accumulator::BlockAccumulator;
use crate::error::EngineError;

pub const CANCELLED_MESSAGE: &str = "turn was cancelled";

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Capacity of each subscriber's outbound queue.
    pub client_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { client_buffer: 256 }
    }
}

/// Everything the worker mutates while streaming, plus the subscriber set.
/// One lock covers both so a (re)connecting subscriber sees a snapshot that
/// lines up exactly with the live events that follow it.
struct StreamState {
    accumulator: BlockAccumulator,
    clients: HashMap<ClientId, mpsc::Sender<TurnEvent>>,
    /// Block announced with `block_start` but not yet with `block_stop`.
    open_block: Option<u32>,
    /// Terminal event sent and all channels closed.
    closed: bool,
}

impl StreamState {
    /// Non-blocking fan-out. Full queues lose the event; closed ones are
    /// detached.
    fn broadcast(&mut self, turn_id: &TurnId, event: TurnEvent) {
        self.clients.retain(|client_id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    turn_id = %turn_id,
                    client_id = %client_id,
                    event = event.event_type(),
                    "client queue full, event dropped"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(turn_id = %turn_id, client_id = %client_id, "client went away");
                false
            }
        });
    }

    fn close_all(&mut self) {
        self.clients.clear();
        self.closed = true;
    }
}

struct Outcome {
    status: TurnStatus,
    error: Option<Arc<EngineError>>,
}

/// Drives one assistant turn from provider stream to persisted blocks and
/// fans the push protocol out to any number of subscribers.
///
/// Starts in `streaming` and ends in exactly one of `complete`, `error` or
/// `cancelled`.
pub struct TurnExecutor {
    turn_id: TurnId,
    repo: Arc<dyn TurnRepository>,
    provider: Arc<dyn LlmProvider>,
    cancel: CancellationToken,
    config: ExecutorConfig,
    stream: Mutex<StreamState>,
    outcome: RwLock<Outcome>,
    metadata: RwLock<Option<StreamMetadata>>,
    started: AtomicBool,
    finished: watch::Sender<Option<TurnStatus>>,
}

impl TurnExecutor {
    pub fn new(
        turn_id: TurnId,
        repo: Arc<dyn TurnRepository>,
        provider: Arc<dyn LlmProvider>,
        config: ExecutorConfig,
    ) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            stream: Mutex::new(StreamState {
                accumulator: BlockAccumulator::new(turn_id.clone(), repo.clone()),
                clients: HashMap::new(),
                open_block: None,
                closed: false,
            }),
            turn_id,
            repo,
            provider,
            cancel: CancellationToken::new(),
            config,
            outcome: RwLock::new(Outcome {
                status: TurnStatus::Streaming,
                error: None,
            }),
            metadata: RwLock::new(None),
            started: AtomicBool::new(false),
            finished,
        }
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    /// Spawn the worker. Returns immediately; a second call is rejected.
    pub fn start(self: &Arc<Self>, request: GenerateRequest) -> Result<JoinHandle<()>, EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted(self.turn_id.clone()));
        }
        let span = info_span!("turn", turn_id = %self.turn_id, model = %request.model);
        let this = Arc::clone(self);
        let handle = tokio::spawn(
            async move {
                let run = AssertUnwindSafe(this.run(request)).catch_unwind().await;
                if let Err(panic) = run {
                    let msg = panic_message(&panic);
                    error!(panic = %msg, "turn worker panicked");
                    this.fail(EngineError::WorkerPanicked(msg));
                }
            }
            .instrument(span),
        );
        Ok(handle)
    }

    /// Request cancellation. Safe to call any number of times; a terminal
    /// status is never changed.
    pub fn interrupt(&self) {
        self.cancel.cancel();
        let mut stream = self.stream.lock();
        if !self.started.load(Ordering::SeqCst) {
            // No worker will ever finish this turn.
            info!(turn_id = %self.turn_id, "turn interrupted before start");
            self.cancel_locked(&mut stream);
            return;
        }
        if self.transition(TurnStatus::Cancelled, None) {
            info!(turn_id = %self.turn_id, "turn interrupted");
        }
    }

    /// Attach a subscriber. It receives live events from now on; use
    /// [`connect`](Self::connect) to get history and live events without a
    /// gap.
    pub fn add_client(&self, client_id: ClientId) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(self.config.client_buffer);
        let mut stream = self.stream.lock();
        if stream.clients.insert(client_id.clone(), tx).is_some() {
            debug!(turn_id = %self.turn_id, client_id = %client_id, "replaced existing client");
        }
        rx
    }

    /// Detach a subscriber, closing its channel. Unknown ids are ignored.
    pub fn remove_client(&self, client_id: &ClientId) {
        self.stream.lock().clients.remove(client_id);
    }

    pub fn client_count(&self) -> usize {
        self.stream.lock().clients.len()
    }

    /// Re-sync an attached subscriber. Its channel is replaced by a fresh
    /// one (closing the old receiver) that starts with every persisted
    /// block, then the in-progress block flagged partial, and, once the turn
    /// has ended, its terminal event followed by closing the channel.
    pub fn handle_reconnection(&self, client_id: &ClientId) -> Result<mpsc::Receiver<TurnEvent>, EngineError> {
        let mut stream = self.stream.lock();
        if !stream.clients.contains_key(client_id) {
            return Err(EngineError::ClientNotFound(client_id.clone()));
        }
        self.attach_with_replay(&mut stream, client_id.clone())
    }

    /// Attach and replay in one step, so no live event can slip in ahead of
    /// or between the catch-up events.
    pub fn connect(&self, client_id: ClientId) -> Result<mpsc::Receiver<TurnEvent>, EngineError> {
        let mut stream = self.stream.lock();
        self.attach_with_replay(&mut stream, client_id)
    }

    pub fn status(&self) -> TurnStatus {
        self.outcome.read().status
    }

    pub fn error(&self) -> Option<Arc<EngineError>> {
        self.outcome.read().error.clone()
    }

    pub fn metadata(&self) -> Option<StreamMetadata> {
        self.metadata.read().clone()
    }

    /// Resolves once the worker has reached a terminal status and closed
    /// every subscriber.
    pub async fn wait_terminal(&self) -> TurnStatus {
        let mut rx = self.finished.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(TurnStatus::Error),
            Err(_) => self.status(),
        };
        status
    }

    async fn run(&self, request: GenerateRequest) {
        if self.stream.lock().closed {
            debug!(turn_id = %self.turn_id, "turn ended before the worker ran");
            return;
        }
        if let Err(e) = self.repo.update_turn_status(&self.turn_id, TurnStatus::Streaming) {
            self.fail(e.into());
            return;
        }
        {
            let mut stream = self.stream.lock();
            stream.broadcast(
                &self.turn_id,
                TurnEvent::TurnStart {
                    turn_id: self.turn_id.clone(),
                    model: request.model.clone(),
                },
            );
        }

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.finish_cancelled(),
            opened = self.provider.stream_response(request, self.cancel.clone()) => opened,
        };
        let mut events = match opened {
            Ok(events) => events,
            Err(e) => return self.fail(e.into()),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.finish_cancelled(),
                next = events.next() => next,
            };
            match next {
                Some(ProviderEvent::Delta(delta)) => {
                    if let Err(e) = self.apply_delta(&delta) {
                        return self.fail(e);
                    }
                }
                Some(ProviderEvent::Metadata(meta)) => return self.complete(meta),
                Some(ProviderEvent::Error(e)) => return self.fail(e.into()),
                None => return self.fail(EngineError::StreamEndedUnexpectedly),
            }
        }
    }

    fn apply_delta(&self, delta: &BlockDelta) -> Result<(), EngineError> {
        let mut stream = self.stream.lock();
        if stream.closed {
            return Ok(());
        }
        if let Some(block) = stream.accumulator.process_delta(delta)? {
            stream.open_block = None;
            stream.broadcast(&self.turn_id, TurnEvent::BlockStop { block_index: block.sequence });
        }
        if stream.open_block != Some(delta.block_index) {
            let block_type = stream
                .accumulator
                .current_type()
                .unwrap_or(quire_core::BlockType::Text);
            stream.open_block = Some(delta.block_index);
            stream.broadcast(
                &self.turn_id,
                TurnEvent::BlockStart {
                    block_index: delta.block_index,
                    block_type,
                    tool_use_id: delta.tool_use_id.clone(),
                    tool_name: delta.tool_name.clone(),
                },
            );
        }
        stream.broadcast(&self.turn_id, TurnEvent::delta(delta));
        Ok(())
    }

    fn complete(&self, meta: StreamMetadata) {
        let mut stream = self.stream.lock();
        if stream.closed {
            return;
        }
        if self.cancel.is_cancelled() {
            return self.cancel_locked(&mut stream);
        }
        if let Err(e) = self.persist_completion(&mut stream, &meta) {
            return self.fail_locked(&mut stream, e);
        }

        *self.metadata.write() = Some(meta.clone());
        self.transition(TurnStatus::Complete, None);
        info!(
            turn_id = %self.turn_id,
            stop_reason = %meta.stop_reason,
            input_tokens = meta.input_tokens,
            output_tokens = meta.output_tokens,
            "turn complete"
        );
        stream.broadcast(&self.turn_id, TurnEvent::complete(self.turn_id.clone(), &meta));
        self.close(&mut stream, TurnStatus::Complete);
    }

    fn persist_completion(&self, stream: &mut StreamState, meta: &StreamMetadata) -> Result<(), EngineError> {
        if let Some(block) = stream.accumulator.finalize()? {
            stream.open_block = None;
            stream.broadcast(&self.turn_id, TurnEvent::BlockStop { block_index: block.sequence });
        }
        self.repo.update_turn_metadata(&self.turn_id, meta)?;
        self.repo.update_turn_status(&self.turn_id, TurnStatus::Complete)?;
        Ok(())
    }

    fn fail(&self, err: EngineError) {
        let mut stream = self.stream.lock();
        self.fail_locked(&mut stream, err);
    }

    fn fail_locked(&self, stream: &mut StreamState, err: EngineError) {
        if stream.closed {
            return;
        }
        // Whatever the stream does after an interrupt is part of cancelling.
        if self.cancel.is_cancelled() {
            debug!(turn_id = %self.turn_id, error = %err, "error after interrupt treated as cancellation");
            return self.cancel_locked(stream);
        }

        let err = Arc::new(err);
        error!(turn_id = %self.turn_id, kind = err.error_kind(), error = %err, "turn failed");
        self.salvage(stream);
        if let Err(e) = self.repo.update_turn_error(&self.turn_id, &err.to_string()) {
            warn!(turn_id = %self.turn_id, error = %e, "failed to persist turn error");
        }
        self.transition(TurnStatus::Error, Some(err.clone()));

        let last_block_index = stream.accumulator.last_written_sequence();
        stream.broadcast(
            &self.turn_id,
            TurnEvent::TurnError {
                turn_id: self.turn_id.clone(),
                error: err.to_string(),
                is_cancelled: false,
                last_block_index,
            },
        );
        self.close(stream, TurnStatus::Error);
    }

    fn finish_cancelled(&self) {
        let mut stream = self.stream.lock();
        self.cancel_locked(&mut stream);
    }

    fn cancel_locked(&self, stream: &mut StreamState) {
        if stream.closed {
            return;
        }
        self.salvage(stream);
        if let Err(e) = self.repo.update_turn_status(&self.turn_id, TurnStatus::Cancelled) {
            warn!(turn_id = %self.turn_id, error = %e, "failed to persist cancellation");
        }
        self.transition(TurnStatus::Cancelled, None);

        let last_block_index = stream.accumulator.last_written_sequence();
        stream.broadcast(
            &self.turn_id,
            TurnEvent::TurnError {
                turn_id: self.turn_id.clone(),
                error: CANCELLED_MESSAGE.into(),
                is_cancelled: true,
                last_block_index,
            },
        );
        self.close(stream, TurnStatus::Cancelled);
    }

    /// Persist whatever is in progress, leniently, and announce it.
    fn salvage(&self, stream: &mut StreamState) {
        match stream.accumulator.salvage() {
            Ok(Some(block)) => {
                debug!(turn_id = %self.turn_id, sequence = block.sequence, "partial block salvaged");
                stream.broadcast(&self.turn_id, TurnEvent::BlockStop { block_index: block.sequence });
            }
            Ok(None) => {}
            Err(e) => warn!(turn_id = %self.turn_id, error = %e, "failed to salvage partial block"),
        }
        stream.open_block = None;
    }

    fn close(&self, stream: &mut StreamState, status: TurnStatus) {
        stream.close_all();
        self.finished.send_replace(Some(status));
    }

    /// Move out of `streaming`. Returns false if already terminal.
    fn transition(&self, status: TurnStatus, error: Option<Arc<EngineError>>) -> bool {
        let mut outcome = self.outcome.write();
        if outcome.status.is_terminal() {
            return false;
        }
        outcome.status = status;
        outcome.error = error;
        true
    }

    /// Queue the catch-up for `client_id` on a new channel sized to hold it
    /// all plus the usual live buffer, so replay is never subject to
    /// drop-on-full. A terminal turn's channel is handed back closed.
    fn attach_with_replay(
        &self,
        stream: &mut StreamState,
        client_id: ClientId,
    ) -> Result<mpsc::Receiver<TurnEvent>, EngineError> {
        let persisted = match self.repo.get_turn_blocks(&self.turn_id) {
            Ok(blocks) => blocks,
            Err(e) => {
                stream.clients.remove(&client_id);
                return Err(e.into());
            }
        };
        let last_block_index = persisted.last().map(|b| b.sequence);
        let mut replay: Vec<TurnEvent> = persisted.iter().map(|b| TurnEvent::catchup(b, false)).collect();
        if let Some(partial) = stream.accumulator.current_block() {
            replay.push(TurnEvent::catchup(&partial, true));
        }
        let status = self.status();
        let terminal = self.terminal_event(status, last_block_index);
        let ended = terminal.is_some() || stream.closed;
        replay.extend(terminal);

        debug!(
            turn_id = %self.turn_id,
            client_id = %client_id,
            events = replay.len(),
            status = %status,
            "replaying to client"
        );
        let (tx, rx) = mpsc::channel(replay.len() + self.config.client_buffer.max(1));
        for event in replay {
            if let Err(e) = tx.try_send(event) {
                warn!(turn_id = %self.turn_id, client_id = %client_id, error = %e, "catch-up event not queued");
            }
        }
        if ended {
            stream.clients.remove(&client_id);
        } else {
            stream.clients.insert(client_id, tx);
        }
        Ok(rx)
    }

    fn terminal_event(&self, status: TurnStatus, last_block_index: Option<u32>) -> Option<TurnEvent> {
        match status {
            TurnStatus::Complete => self
                .metadata()
                .map(|meta| TurnEvent::complete(self.turn_id.clone(), &meta)),
            TurnStatus::Error => Some(TurnEvent::TurnError {
                turn_id: self.turn_id.clone(),
                error: self.error().map(|e| e.to_string()).unwrap_or_default(),
                is_cancelled: false,
                last_block_index,
            }),
            TurnStatus::Cancelled => Some(TurnEvent::TurnError {
                turn_id: self.turn_id.clone(),
                error: CANCELLED_MESSAGE.into(),
                is_cancelled: true,
                last_block_index,
            }),
            TurnStatus::Pending | TurnStatus::Streaming => None,
        }
    }
}

impl Drop for TurnExecutor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use quire_core::{BlockType, ProviderError, StopReason};
    use quire_llm::{mock_metadata, MockProvider, MockResponse};
    use quire_store::TurnRepo;

    use crate::testing::{repo_with_turn, FlakyRepo};

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "mock-model".into(),
            messages: Vec::new(),
            params: Default::default(),
        }
    }

    fn executor_with(repo: Arc<dyn TurnRepository>, turn_id: TurnId, provider: MockProvider) -> Arc<TurnExecutor> {
        Arc::new(TurnExecutor::new(
            turn_id,
            repo,
            Arc::new(provider),
            ExecutorConfig::default(),
        ))
    }

    fn scripted(events: Vec<ProviderEvent>) -> (Arc<TurnExecutor>, Arc<TurnRepo>, TurnId) {
        let (repo, turn_id) = repo_with_turn();
        let provider = MockProvider::new(vec![MockResponse::Stream(events)]);
        (executor_with(repo.clone(), turn_id.clone(), provider), repo, turn_id)
    }

    async fn drain(rx: &mut mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Read until `pred` matches, returning everything seen.
    async fn read_until(rx: &mut mpsc::Receiver<TurnEvent>, pred: impl Fn(&TurnEvent) -> bool) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed early");
            let done = pred(&event);
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn count(events: &[TurnEvent], kind: &str) -> usize {
        events.iter().filter(|e| e.event_type() == kind).count()
    }

    fn delta(d: BlockDelta) -> ProviderEvent {
        ProviderEvent::Delta(d)
    }

    #[tokio::test]
    async fn text_then_tool_call_streams_and_persists() {
        let (exec, repo, turn_id) = scripted(vec![
            delta(BlockDelta::text(0, "Hel").with_block_type(BlockType::Text)),
            delta(BlockDelta::text(0, "lo")),
            delta(BlockDelta {
                json_delta: Some("{\"path\"".into()),
                ..BlockDelta::tool_call_start(1, "tu_1", "doc_view")
            }),
            delta(BlockDelta::input_json(1, ":\"/a\"}")),
            ProviderEvent::Metadata(mock_metadata(StopReason::ToolUse)),
        ]);
        let mut rx = exec.add_client(ClientId::new());
        exec.start(request()).unwrap();
        let events = drain(&mut rx).await;

        let kinds: Vec<_> = events.iter().map(TurnEvent::event_type).collect();
        assert_eq!(
            kinds,
            vec![
                "turn_start",
                "block_start",
                "block_delta",
                "block_delta",
                "block_stop",
                "block_start",
                "block_delta",
                "block_delta",
                "block_stop",
                "turn_complete",
            ]
        );
        assert_eq!(count(&events, "block_delta"), 4);
        assert_eq!(count(&events, "block_stop"), 2);
        assert_eq!(count(&events, "turn_complete"), 1);
        assert!(matches!(events[4], TurnEvent::BlockStop { block_index: 0 }));
        assert!(matches!(events[8], TurnEvent::BlockStop { block_index: 1 }));
        match events.last() {
            Some(TurnEvent::TurnComplete {
                stop_reason,
                input_tokens,
                output_tokens,
                ..
            }) => {
                assert_eq!(*stop_reason, StopReason::ToolUse);
                assert_eq!((*input_tokens, *output_tokens), (10, 20));
            }
            other => panic!("expected turn_complete, got {other:?}"),
        }
        assert!(matches!(
            &events[5],
            TurnEvent::BlockStart { block_index: 1, block_type: BlockType::ToolUse, tool_name: Some(name), .. }
                if name == "doc_view"
        ));

        assert_eq!(exec.status(), TurnStatus::Complete);
        assert!(exec.error().is_none());
        assert_eq!(exec.metadata().unwrap().stop_reason, StopReason::ToolUse);
        assert_eq!(exec.client_count(), 0);

        let blocks = repo.get_turn_blocks(&turn_id).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text_content.as_deref(), Some("Hello"));
        assert_eq!(blocks[1].block_type, BlockType::ToolUse);
        assert_eq!(blocks[1].content.as_ref().unwrap()["input"], serde_json::json!({"path": "/a"}));
        let turn = repo.get_turn(&turn_id).unwrap();
        assert_eq!(turn.status, TurnStatus::Complete);
        assert_eq!(turn.output_tokens, Some(20));
        assert!(turn.completed_at.is_some());
    }

    #[tokio::test]
    async fn mid_stream_reconnection_gets_catchup_then_live() {
        let (repo, turn_id) = repo_with_turn();
        let (provider, feed) = MockProvider::live();
        let exec = executor_with(repo.clone(), turn_id, provider);
        let mut watcher = exec.add_client(ClientId::new());
        exec.start(request()).unwrap();

        feed.delta(BlockDelta::text(0, "first")).await;
        feed.delta(BlockDelta::thinking(1, "second")).await;
        feed.delta(BlockDelta::text(2, "thi")).await;
        read_until(&mut watcher, |e| matches!(e, TurnEvent::BlockDelta { block_index: 2, .. })).await;

        let mut late = exec.connect(ClientId::new()).unwrap();
        let catchup = read_until(&mut late, |e| matches!(e, TurnEvent::BlockCatchup { is_partial: true, .. })).await;
        assert_eq!(catchup.len(), 3);
        assert!(matches!(
            &catchup[0],
            TurnEvent::BlockCatchup { block_index: 0, is_partial: false, text_content: Some(t), .. } if t == "first"
        ));
        assert!(matches!(
            &catchup[1],
            TurnEvent::BlockCatchup { block_index: 1, block_type: BlockType::Thinking, is_partial: false, .. }
        ));
        assert!(matches!(
            &catchup[2],
            TurnEvent::BlockCatchup { block_index: 2, text_content: Some(t), .. } if t == "thi"
        ));

        feed.delta(BlockDelta::text(2, "rd")).await;
        feed.delta(BlockDelta::text(3, "fourth")).await;
        feed.delta(BlockDelta::text(4, "fif")).await;
        feed.delta(BlockDelta::text(4, "th")).await;
        feed.finish(mock_metadata(StopReason::EndTurn)).await;
        let live = drain(&mut late).await;
        let kinds: Vec<_> = live.iter().map(TurnEvent::event_type).collect();
        assert_eq!(
            kinds,
            vec![
                "block_delta",
                "block_stop",
                "block_start",
                "block_delta",
                "block_stop",
                "block_start",
                "block_delta",
                "block_delta",
                "block_stop",
                "turn_complete",
            ]
        );
        let stops: Vec<u32> = live
            .iter()
            .filter_map(|e| match e {
                TurnEvent::BlockStop { block_index } => Some(*block_index),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![2, 3, 4]);
        assert!(matches!(&live[0], TurnEvent::BlockDelta { block_index: 2, .. }));

        let blocks = repo.get_turn_blocks(exec.turn_id()).unwrap();
        let texts: Vec<_> = blocks.iter().filter_map(|b| b.text_content.as_deref()).collect();
        assert_eq!(texts, vec!["first", "second", "third", "fourth", "fifth"]);
    }

    #[tokio::test]
    async fn reconnection_after_completion_replays_and_closes() {
        let (exec, _, _) = scripted(vec![
            delta(BlockDelta::text(0, "done")),
            ProviderEvent::Metadata(mock_metadata(StopReason::EndTurn)),
        ]);
        exec.start(request()).unwrap();
        assert_eq!(exec.wait_terminal().await, TurnStatus::Complete);

        let mut rx = exec.connect(ClientId::new()).unwrap();
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TurnEvent::BlockCatchup { is_partial: false, .. }));
        assert!(matches!(
            &events[1],
            TurnEvent::TurnComplete { stop_reason: StopReason::EndTurn, .. }
        ));
        assert_eq!(exec.client_count(), 0);
    }

    #[tokio::test]
    async fn handle_reconnection_requires_attached_client() {
        let (exec, _, _) = scripted(vec![]);
        let err = exec.handle_reconnection(&ClientId::new()).unwrap_err();
        assert!(matches!(err, EngineError::ClientNotFound(_)));
    }

    #[tokio::test]
    async fn interrupt_cancels_and_salvages_partial_block() {
        let (repo, turn_id) = repo_with_turn();
        let (provider, feed) = MockProvider::live();
        let exec = executor_with(repo.clone(), turn_id.clone(), provider);
        let mut rx = exec.add_client(ClientId::new());
        exec.start(request()).unwrap();

        feed.delta(BlockDelta::text(0, "half a thou")).await;
        read_until(&mut rx, |e| e.event_type() == "block_delta").await;

        exec.interrupt();
        exec.interrupt();
        assert_eq!(exec.status(), TurnStatus::Cancelled);
        feed.fail(ProviderError::StreamInterrupted("reset".into())).await;
        assert_eq!(exec.wait_terminal().await, TurnStatus::Cancelled);

        let rest = drain(&mut rx).await;
        assert!(matches!(rest[0], TurnEvent::BlockStop { block_index: 0 }));
        match rest.last() {
            Some(TurnEvent::TurnError {
                error,
                is_cancelled,
                last_block_index,
                ..
            }) => {
                assert_eq!(error, CANCELLED_MESSAGE);
                assert!(*is_cancelled);
                assert_eq!(*last_block_index, Some(0));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(exec.error().is_none());
        assert_eq!(
            repo.get_turn_blocks(&turn_id).unwrap()[0].text_content.as_deref(),
            Some("half a thou")
        );
        assert_eq!(repo.get_turn(&turn_id).unwrap().status, TurnStatus::Cancelled);
    }

    #[tokio::test]
    async fn interrupt_after_completion_keeps_status() {
        let (exec, _, _) = scripted(vec![
            delta(BlockDelta::text(0, "ok")),
            ProviderEvent::Metadata(mock_metadata(StopReason::EndTurn)),
        ]);
        exec.start(request()).unwrap();
        exec.wait_terminal().await;
        exec.interrupt();
        assert_eq!(exec.status(), TurnStatus::Complete);
    }

    #[tokio::test]
    async fn provider_error_fails_turn_with_last_block_index() {
        let (repo, turn_id) = repo_with_turn();
        let provider = MockProvider::new(vec![MockResponse::failing_after(
            vec![BlockDelta::text(0, "one"), BlockDelta::text(1, "tw")],
            ProviderError::StreamInterrupted("connection reset".into()),
        )]);
        let exec = executor_with(repo.clone(), turn_id.clone(), provider);
        let mut rx = exec.add_client(ClientId::new());
        exec.start(request()).unwrap();
        let events = drain(&mut rx).await;

        match events.last() {
            Some(TurnEvent::TurnError {
                error,
                is_cancelled,
                last_block_index,
                ..
            }) => {
                assert!(error.contains("connection reset"));
                assert!(!is_cancelled);
                assert_eq!(*last_block_index, Some(1));
            }
            other => panic!("expected turn_error, got {other:?}"),
        }
        assert_eq!(exec.status(), TurnStatus::Error);
        assert!(matches!(exec.error().as_deref(), Some(EngineError::Provider(_))));
        let turn = repo.get_turn(&turn_id).unwrap();
        assert_eq!(turn.status, TurnStatus::Error);
        assert!(turn.error.unwrap().contains("connection reset"));
        assert_eq!(repo.get_turn_blocks(&turn_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_stream_open_is_an_error() {
        let (repo, turn_id) = repo_with_turn();
        let provider = MockProvider::new(vec![MockResponse::Error(ProviderError::Overloaded)]);
        let exec = executor_with(repo, turn_id, provider);
        exec.start(request()).unwrap();
        assert_eq!(exec.wait_terminal().await, TurnStatus::Error);
        assert!(matches!(
            exec.error().as_deref(),
            Some(EngineError::Provider(ProviderError::Overloaded))
        ));
    }

    #[tokio::test]
    async fn stream_closed_without_metadata_is_an_error() {
        let (exec, _, _) = scripted(vec![delta(BlockDelta::text(0, "cut"))]);
        exec.start(request()).unwrap();
        assert_eq!(exec.wait_terminal().await, TurnStatus::Error);
        assert!(matches!(
            exec.error().as_deref(),
            Some(EngineError::StreamEndedUnexpectedly)
        ));
    }

    #[tokio::test]
    async fn malformed_tool_input_fails_turn_and_keeps_raw_input() {
        let (exec, repo, turn_id) = scripted(vec![
            delta(BlockDelta::tool_call_start(0, "tu_1", "doc_view")),
            delta(BlockDelta::input_json(0, "{\"doc_id\": ")),
            ProviderEvent::Metadata(mock_metadata(StopReason::ToolUse)),
        ]);
        exec.start(request()).unwrap();
        assert_eq!(exec.wait_terminal().await, TurnStatus::Error);
        assert!(matches!(
            exec.error().as_deref(),
            Some(EngineError::MalformedToolInput { sequence: 0, .. })
        ));
        let blocks = repo.get_turn_blocks(&turn_id).unwrap();
        assert_eq!(blocks[0].content_str("input_partial"), Some("{\"doc_id\": "));
    }

    #[tokio::test]
    async fn metadata_write_failure_fails_turn() {
        let (inner, turn_id) = repo_with_turn();
        let flaky = Arc::new(FlakyRepo::new(inner.clone()));
        flaky.fail_metadata.store(true, Ordering::SeqCst);
        let provider = MockProvider::new(vec![MockResponse::text("hello")]);
        let exec = executor_with(flaky, turn_id.clone(), provider);
        let mut rx = exec.add_client(ClientId::new());
        exec.start(request()).unwrap();
        let events = drain(&mut rx).await;

        assert_eq!(count(&events, "turn_complete"), 0);
        assert!(matches!(events.last(), Some(TurnEvent::TurnError { is_cancelled: false, .. })));
        assert_eq!(exec.status(), TurnStatus::Error);
        assert!(exec.metadata().is_none());
        assert_eq!(inner.get_turn(&turn_id).unwrap().status, TurnStatus::Error);
    }

    #[tokio::test]
    async fn out_of_order_delta_fails_turn() {
        let (exec, _, _) = scripted(vec![
            delta(BlockDelta::text(0, "a")),
            delta(BlockDelta::text(2, "skipped one")),
            ProviderEvent::Metadata(mock_metadata(StopReason::EndTurn)),
        ]);
        exec.start(request()).unwrap();
        assert_eq!(exec.wait_terminal().await, TurnStatus::Error);
        assert!(matches!(
            exec.error().as_deref(),
            Some(EngineError::OutOfOrderDelta { expected: 1, got: 2 })
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (exec, _, _) = scripted(vec![ProviderEvent::Metadata(mock_metadata(StopReason::EndTurn))]);
        exec.start(request()).unwrap();
        assert!(matches!(exec.start(request()), Err(EngineError::AlreadyStarted(_))));
        assert_eq!(exec.wait_terminal().await, TurnStatus::Complete);
    }

    #[tokio::test]
    async fn slow_client_loses_events_without_stalling_the_turn() {
        let (repo, turn_id) = repo_with_turn();
        let mut events: Vec<ProviderEvent> = (0..20).map(|i| delta(BlockDelta::text(0, format!("w{i} ")))).collect();
        events.push(ProviderEvent::Metadata(mock_metadata(StopReason::EndTurn)));
        let exec = Arc::new(TurnExecutor::new(
            turn_id.clone(),
            repo.clone(),
            Arc::new(MockProvider::new(vec![MockResponse::Stream(events)])),
            ExecutorConfig { client_buffer: 2 },
        ));
        let mut rx = exec.add_client(ClientId::new());
        exec.start(request()).unwrap();

        assert_eq!(exec.wait_terminal().await, TurnStatus::Complete);
        let received = drain(&mut rx).await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].event_type(), "turn_start");
        assert_eq!(repo.get_turn_blocks(&turn_id).unwrap()[0].text_content.as_deref().map(str::len), Some(70));
    }

    #[tokio::test]
    async fn catchup_larger_than_client_buffer_is_delivered_in_full() {
        let (repo, turn_id) = repo_with_turn();
        let mut script: Vec<ProviderEvent> = (0..300).map(|i| delta(BlockDelta::text(i, format!("b{i}")))).collect();
        script.push(ProviderEvent::Metadata(mock_metadata(StopReason::EndTurn)));
        let exec = Arc::new(TurnExecutor::new(
            turn_id,
            repo,
            Arc::new(MockProvider::new(vec![MockResponse::Stream(script)])),
            ExecutorConfig { client_buffer: 4 },
        ));
        exec.start(request()).unwrap();
        assert_eq!(exec.wait_terminal().await, TurnStatus::Complete);

        let events = drain(&mut exec.connect(ClientId::new()).unwrap()).await;
        assert_eq!(events.len(), 301);
        assert_eq!(count(&events, "block_catchup"), 300);
        assert!(matches!(events.last(), Some(TurnEvent::TurnComplete { .. })));
        assert!(matches!(&events[299], TurnEvent::BlockCatchup { block_index: 299, .. }));
        assert_eq!(exec.client_count(), 0);
    }

    #[tokio::test]
    async fn handle_reconnection_resyncs_attached_client() {
        let (repo, turn_id) = repo_with_turn();
        let (provider, feed) = MockProvider::live();
        let exec = executor_with(repo, turn_id, provider);
        let client = ClientId::new();
        let mut stale = exec.add_client(client.clone());
        exec.start(request()).unwrap();

        feed.delta(BlockDelta::text(0, "one")).await;
        feed.delta(BlockDelta::text(1, "tw")).await;
        read_until(&mut stale, |e| matches!(e, TurnEvent::BlockDelta { block_index: 1, .. })).await;

        let mut fresh = exec.handle_reconnection(&client).unwrap();
        assert!(stale.recv().await.is_none());
        assert_eq!(exec.client_count(), 1);

        let catchup = read_until(&mut fresh, |e| matches!(e, TurnEvent::BlockCatchup { is_partial: true, .. })).await;
        assert_eq!(catchup.len(), 2);

        feed.delta(BlockDelta::text(1, "o")).await;
        feed.finish(mock_metadata(StopReason::EndTurn)).await;
        let kinds: Vec<_> = drain(&mut fresh).await.iter().map(TurnEvent::event_type).collect();
        assert_eq!(kinds, vec!["block_delta", "block_stop", "turn_complete"]);
    }

    #[tokio::test]
    async fn interrupt_before_start_finishes_the_turn() {
        let (repo, turn_id) = repo_with_turn();
        let exec = executor_with(repo.clone(), turn_id.clone(), MockProvider::new(vec![]));
        let mut rx = exec.add_client(ClientId::new());

        exec.interrupt();
        assert_eq!(exec.wait_terminal().await, TurnStatus::Cancelled);
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TurnEvent::TurnError { is_cancelled: true, .. }));
        assert_eq!(repo.get_turn(&turn_id).unwrap().status, TurnStatus::Cancelled);

        exec.start(request()).unwrap().await.unwrap();
        assert_eq!(exec.status(), TurnStatus::Cancelled);
        assert_eq!(repo.get_turn(&turn_id).unwrap().status, TurnStatus::Cancelled);
    }

    #[tokio::test]
    async fn clients_can_be_added_and_removed() {
        let (exec, _, _) = scripted(vec![]);
        let a = ClientId::new();
        let b = ClientId::new();
        let _rx_a = exec.add_client(a.clone());
        let mut rx_b = exec.add_client(b.clone());
        assert_eq!(exec.client_count(), 2);

        exec.remove_client(&b);
        exec.remove_client(&ClientId::new());
        assert_eq!(exec.client_count(), 1);
        assert!(rx_b.recv().await.is_none());
    }
}
