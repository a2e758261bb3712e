use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use quire_core::{BlockDelta, BlockId, BlockType, DeltaKind, TurnBlock, TurnId};
use quire_store::TurnRepository;

use crate::error::EngineError;

/// The block currently being built from deltas.
#[derive(Debug)]
struct PendingBlock {
    id: BlockId,
    sequence: u32,
    block_type: BlockType,
    text: String,
    json: String,
    signature: Option<String>,
    tool_use_id: Option<String>,
    tool_name: Option<String>,
    created_at: DateTime<Utc>,
}

/// How to treat tool input that does not parse as JSON.
#[derive(Clone, Copy, PartialEq, Eq)]
enum InputMode {
    /// Parse failure is an error.
    Strict,
    /// Keep the raw fragment under `input_partial`.
    Lenient,
}

impl PendingBlock {
    fn open(delta: &BlockDelta) -> Self {
        let block_type = delta.block_type.unwrap_or_else(|| infer_block_type(delta.delta_type));
        Self {
            id: BlockId::new(),
            sequence: delta.block_index,
            block_type,
            text: String::new(),
            json: String::new(),
            signature: None,
            tool_use_id: None,
            tool_name: None,
            created_at: Utc::now(),
        }
    }

    fn merge(&mut self, delta: &BlockDelta) {
        if let Some(text) = &delta.text_delta {
            self.text.push_str(text);
        }
        if let Some(fragment) = &delta.json_delta {
            self.json.push_str(fragment);
        }
        // Metadata is overwritten when present and never cleared.
        if delta.signature_delta.is_some() {
            self.signature.clone_from(&delta.signature_delta);
        }
        if delta.tool_use_id.is_some() {
            self.tool_use_id.clone_from(&delta.tool_use_id);
        }
        if delta.tool_name.is_some() {
            self.tool_name.clone_from(&delta.tool_name);
        }
    }

    fn to_block(&self, turn_id: &TurnId, mode: InputMode) -> Result<TurnBlock, EngineError> {
        let (text_content, content) = match self.block_type {
            BlockType::Text | BlockType::ToolResult => (self.text_content(), None),
            BlockType::Thinking => {
                let content = self.signature.as_ref().map(|sig| {
                    let mut map = Map::new();
                    map.insert("signature".into(), Value::String(sig.clone()));
                    map
                });
                (self.text_content(), content)
            }
            BlockType::ToolUse => (None, Some(self.tool_content(mode)?)),
        };
        Ok(TurnBlock {
            id: self.id.clone(),
            turn_id: turn_id.clone(),
            block_type: self.block_type,
            sequence: self.sequence,
            text_content,
            content,
            created_at: self.created_at,
        })
    }

    /// Empty text is stored as no text at all.
    fn text_content(&self) -> Option<String> {
        (!self.text.is_empty()).then(|| self.text.clone())
    }

    fn tool_content(&self, mode: InputMode) -> Result<Map<String, Value>, EngineError> {
        let mut map = Map::new();
        if let Some(id) = &self.tool_use_id {
            map.insert("tool_use_id".into(), Value::String(id.clone()));
        }
        if let Some(name) = &self.tool_name {
            map.insert("tool_name".into(), Value::String(name.clone()));
        }
        if self.json.trim().is_empty() {
            return Ok(map);
        }
        match serde_json::from_str::<Value>(&self.json) {
            Ok(input) => {
                map.insert("input".into(), input);
            }
            Err(_) if mode == InputMode::Lenient => {
                map.insert("input_partial".into(), Value::String(self.json.clone()));
            }
            Err(source) => {
                return Err(EngineError::MalformedToolInput {
                    sequence: self.sequence,
                    source,
                })
            }
        }
        Ok(map)
    }
}

fn infer_block_type(kind: Option<DeltaKind>) -> BlockType {
    match kind {
        Some(DeltaKind::ThinkingDelta | DeltaKind::SignatureDelta) => BlockType::Thinking,
        Some(DeltaKind::ToolCallStart | DeltaKind::InputJsonDelta) => BlockType::ToolUse,
        _ => BlockType::Text,
    }
}

/// Folds a turn's delta stream into blocks, persisting each block once the
/// stream has moved past it.
///
/// Holds at most one in-progress block. Block indices must arrive in order
/// starting at zero without gaps; anything else is rejected.
pub struct BlockAccumulator {
    turn_id: TurnId,
    repo: Arc<dyn TurnRepository>,
    current: Option<PendingBlock>,
    last_written: Option<u32>,
}

impl BlockAccumulator {
    pub fn new(turn_id: TurnId, repo: Arc<dyn TurnRepository>) -> Self {
        Self {
            turn_id,
            repo,
            current: None,
            last_written: None,
        }
    }

    /// Apply one delta. When the delta opens a new block, the previous one
    /// is persisted first and returned.
    ///
    /// On error the in-progress block is left untouched.
    pub fn process_delta(&mut self, delta: &BlockDelta) -> Result<Option<TurnBlock>, EngineError> {
        if let Some(current) = self.current.as_mut() {
            if current.sequence == delta.block_index {
                current.merge(delta);
                return Ok(None);
            }
        }

        let expected = self.next_sequence();
        if delta.block_index != expected {
            return Err(EngineError::OutOfOrderDelta {
                expected,
                got: delta.block_index,
            });
        }

        let flushed = self.finalize()?;
        let mut block = PendingBlock::open(delta);
        block.merge(delta);
        self.current = Some(block);
        Ok(flushed)
    }

    /// Persist and return the in-progress block. Calling it again, or with
    /// nothing in progress, is a no-op returning `None`.
    #[instrument(skip(self), fields(turn_id = %self.turn_id))]
    pub fn finalize(&mut self) -> Result<Option<TurnBlock>, EngineError> {
        let Some(pending) = self.current.as_ref() else {
            return Ok(None);
        };
        let block = pending.to_block(&self.turn_id, InputMode::Strict)?;
        self.repo.create_turn_block(&block)?;
        debug!(sequence = block.sequence, block_type = %block.block_type, "block persisted");
        self.current = None;
        self.last_written = Some(block.sequence);
        Ok(Some(block))
    }

    /// Best-effort flush for a turn that is failing or being cancelled:
    /// unparseable tool input is stored as `input_partial` instead of
    /// failing. The in-progress block is dropped even if the write fails.
    #[instrument(skip(self), fields(turn_id = %self.turn_id))]
    pub fn salvage(&mut self) -> Result<Option<TurnBlock>, EngineError> {
        let Some(pending) = self.current.take() else {
            return Ok(None);
        };
        let block = pending.to_block(&self.turn_id, InputMode::Lenient)?;
        self.repo.create_turn_block(&block)?;
        self.last_written = Some(block.sequence);
        Ok(Some(block))
    }

    /// Snapshot of the in-progress block without persisting it.
    pub fn current_block(&self) -> Option<TurnBlock> {
        self.current
            .as_ref()
            .and_then(|p| p.to_block(&self.turn_id, InputMode::Lenient).ok())
    }

    /// Index of the block currently being accumulated.
    pub fn current_index(&self) -> Option<u32> {
        self.current.as_ref().map(|p| p.sequence)
    }

    pub fn current_type(&self) -> Option<BlockType> {
        self.current.as_ref().map(|p| p.block_type)
    }

    /// Sequence of the most recently persisted block.
    pub fn last_written_sequence(&self) -> Option<u32> {
        self.last_written
    }

    fn next_sequence(&self) -> u32 {
        match (&self.current, self.last_written) {
            (Some(current), _) => current.sequence + 1,
            (None, Some(last)) => last + 1,
            (None, None) => 0,
        }
    }
}
