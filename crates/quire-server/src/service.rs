use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{display, Empty};
use tracing::{info, instrument, warn};

use quire_core::{
    BlockId, BlockType, ChatId, GenerateRequest, GenerationParams, HistoryMessage, LlmProvider, Role, Turn, TurnBlock,
    TurnId, TurnStatus,
};
use quire_engine::{EngineError, ExecutorConfig, ExecutorRegistry, TurnExecutor};
use quire_store::chats::title_from_text;
use quire_store::{ChatRepo, ChatRow, Database, StoreError, TurnRepo, TurnRepository};

use crate::error::ServerError;

/// One block of a user turn as submitted by the client.
#[derive(Clone, Debug, Deserialize)]
pub struct TurnBlockInput {
    pub block_type: BlockType,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub content: Option<Map<String, Value>>,
}

impl TurnBlockInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Text,
            text_content: Some(text.into()),
            content: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateTurnRequest {
    /// Chat to post into. Inferred from `prev_turn_id` when absent; a new
    /// chat is created when both are absent.
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub prev_turn_id: Option<TurnId>,
    #[serde(default)]
    pub turn_blocks: Vec<TurnBlockInput>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub params: Option<GenerationParams>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CreateTurnResponse {
    pub chat_id: ChatId,
    pub user_turn: Turn,
    pub assistant_turn: Turn,
    pub stream_url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TurnBlocksResponse {
    pub turn_id: TurnId,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub blocks: Vec<TurnBlock>,
}

/// Creates turns, wires up their executors and answers turn queries.
pub struct TurnService {
    chats: ChatRepo,
    turns: Arc<TurnRepo>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ExecutorRegistry>,
    executor_config: ExecutorConfig,
    default_model: String,
}

impl TurnService {
    pub fn new(
        db: Database,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ExecutorRegistry>,
        executor_config: ExecutorConfig,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            chats: ChatRepo::new(db.clone()),
            turns: Arc::new(TurnRepo::new(db)),
            provider,
            registry,
            executor_config,
            default_model: default_model.into(),
        }
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn create_chat(&self, title: Option<&str>) -> Result<ChatRow, ServerError> {
        Ok(self.chats.create(title.unwrap_or_default())?)
    }

    pub fn list_chats(&self, limit: u32, offset: u32) -> Result<Vec<ChatRow>, ServerError> {
        Ok(self.chats.list(limit, offset)?)
    }

    /// Persist a user turn, create its pending assistant reply and start
    /// streaming it. Returns as soon as the executor is running.
    #[instrument(
        skip(self, req),
        fields(chat_id = Empty, user_turn_id = Empty, assistant_turn_id = Empty)
    )]
    pub fn create_turn(&self, req: CreateTurnRequest) -> Result<CreateTurnResponse, ServerError> {
        validate_blocks(&req.turn_blocks)?;
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        if !self.provider.supports_model(&model) {
            return Err(ServerError::BadRequest(format!(
                "model {model} is not supported by provider {}",
                self.provider.name()
            )));
        }
        let chat_id = self.resolve_chat(&req)?;
        let span = tracing::Span::current();
        span.record("chat_id", display(&chat_id));

        let now = Utc::now();
        let mut user_turn = Turn::new(chat_id.clone(), req.prev_turn_id.clone(), Role::User);
        user_turn.status = TurnStatus::Complete;
        user_turn.completed_at = Some(now);
        let blocks: Vec<TurnBlock> = req
            .turn_blocks
            .into_iter()
            .enumerate()
            .map(|(i, input)| TurnBlock {
                id: BlockId::new(),
                turn_id: user_turn.id.clone(),
                block_type: input.block_type,
                sequence: i as u32,
                text_content: input.text_content,
                content: input.content,
                created_at: now,
            })
            .collect();
        self.turns.create_turn_with_blocks(&user_turn, &blocks)?;

        // Read before the assistant turn is inserted: no pending turn may
        // outlive a failed request.
        let request = GenerateRequest {
            model: model.clone(),
            messages: self.history(&user_turn.id)?,
            params: req.params.unwrap_or_default(),
        };

        let mut assistant_turn = Turn::new(chat_id.clone(), Some(user_turn.id.clone()), Role::Assistant);
        assistant_turn.model = Some(model);
        self.turns.create_turn(&assistant_turn)?;
        if let Err(e) = self.chats.touch(&chat_id) {
            warn!(chat_id = %chat_id, error = %e, "failed to touch chat");
        }
        span.record("user_turn_id", display(&user_turn.id));
        span.record("assistant_turn_id", display(&assistant_turn.id));

        if let Err(e) = self.spawn_executor(&assistant_turn.id, request) {
            if let Err(update) = self.turns.update_turn_error(&assistant_turn.id, &e.to_string()) {
                warn!(error = %update, "failed to record executor start failure");
            }
            return Err(e);
        }

        info!(blocks = blocks.len(), "turn created");
        let stream_url = format!("/api/turns/{}/stream", assistant_turn.id);
        Ok(CreateTurnResponse {
            chat_id,
            user_turn,
            assistant_turn,
            stream_url,
        })
    }

    /// Cancel a streaming turn. Returns the executor's status afterwards.
    pub fn interrupt_turn(&self, turn_id: &TurnId) -> Result<TurnStatus, ServerError> {
        let executor = self
            .registry
            .get(turn_id)
            .ok_or_else(|| ServerError::NotFound("turn is not currently streaming".into()))?;
        executor.interrupt();
        Ok(executor.status())
    }

    pub fn get_turn(&self, turn_id: &TurnId) -> Result<Turn, ServerError> {
        Ok(self.turns.get_turn(turn_id)?)
    }

    /// Persisted blocks of a turn along with its status.
    pub fn turn_blocks(&self, turn_id: &TurnId) -> Result<TurnBlocksResponse, ServerError> {
        let turn = self.turns.get_turn(turn_id)?;
        let blocks = self.turns.get_turn_blocks(turn_id)?;
        Ok(TurnBlocksResponse {
            turn_id: turn.id,
            status: turn.status,
            error: turn.error,
            blocks,
        })
    }

    pub fn executor(&self, turn_id: &TurnId) -> Option<Arc<TurnExecutor>> {
        self.registry.get(turn_id)
    }

    fn resolve_chat(&self, req: &CreateTurnRequest) -> Result<ChatId, ServerError> {
        if let Some(prev) = &req.prev_turn_id {
            let prev_turn = self.turns.get_turn(prev).map_err(|e| match e {
                StoreError::NotFound(_) => {
                    ServerError::BadRequest(format!("prev_turn_id references non-existent turn {prev}"))
                }
                other => other.into(),
            })?;
            if let Some(chat_id) = &req.chat_id {
                if *chat_id != prev_turn.chat_id {
                    return Err(ServerError::BadRequest(format!(
                        "turn {prev} does not belong to chat {chat_id}"
                    )));
                }
            }
            return Ok(prev_turn.chat_id);
        }
        if let Some(chat_id) = &req.chat_id {
            return Ok(self.chats.get(chat_id)?.id);
        }
        let opening = req
            .turn_blocks
            .iter()
            .find_map(|b| b.text_content.as_deref())
            .unwrap_or_default();
        let chat = self.chats.create(&title_from_text(opening))?;
        info!(chat_id = %chat.id, title = %chat.title, "chat created for new conversation");
        Ok(chat.id)
    }

    /// The branch ending at `leaf`, root first, as provider history.
    fn history(&self, leaf: &TurnId) -> Result<Vec<HistoryMessage>, ServerError> {
        self.turns
            .ancestry(leaf)?
            .into_iter()
            .map(|turn| -> Result<HistoryMessage, ServerError> {
                Ok(HistoryMessage {
                    role: turn.role,
                    blocks: self.turns.get_turn_blocks(&turn.id)?,
                })
            })
            .collect()
    }

    fn spawn_executor(&self, turn_id: &TurnId, request: GenerateRequest) -> Result<(), ServerError> {
        let executor = Arc::new(TurnExecutor::new(
            turn_id.clone(),
            self.turns.clone(),
            self.provider.clone(),
            self.executor_config.clone(),
        ));
        if !self.registry.register(turn_id.clone(), executor.clone()) {
            return Err(EngineError::AlreadyRegistered(turn_id.clone()).into());
        }
        let worker = match executor.start(request) {
            Ok(worker) => worker,
            Err(e) => {
                self.registry.remove(turn_id);
                return Err(e.into());
            }
        };

        let registry = Arc::clone(&self.registry);
        let turn_id = turn_id.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                warn!(turn_id = %turn_id, error = %e, "turn worker did not finish cleanly");
            }
            registry.mark_completed(&turn_id);
        });
        Ok(())
    }
}

fn validate_blocks(blocks: &[TurnBlockInput]) -> Result<(), ServerError> {
    if blocks.is_empty() {
        return Err(ServerError::BadRequest("turn_blocks must not be empty".into()));
    }
    for (i, block) in blocks.iter().enumerate() {
        match block.block_type {
            BlockType::Text => {
                let text = block.text_content.as_deref().unwrap_or_default();
                if text.trim().is_empty() {
                    return Err(ServerError::BadRequest(format!("block {i}: text block must have text_content")));
                }
            }
            BlockType::ToolResult => {
                let has_id = block
                    .content
                    .as_ref()
                    .and_then(|c| c.get("tool_use_id"))
                    .is_some_and(Value::is_string);
                if !has_id {
                    return Err(ServerError::BadRequest(format!(
                        "block {i}: tool_result block must reference a tool_use_id"
                    )));
                }
            }
            BlockType::Thinking | BlockType::ToolUse => {
                return Err(ServerError::BadRequest(format!(
                    "block {i}: {} blocks are produced by the assistant only",
                    block.block_type
                )));
            }
        }
    }
    Ok(())
}
