use serde::{Deserialize, Serialize};

use crate::ids::TurnId;
use crate::stream::{BlockDelta, DeltaKind, StreamMetadata};
use crate::turns::{BlockType, StopReason, TurnBlock};

/// Push-protocol events broadcast to subscribers of a streaming turn.
///
/// For a live turn the order is `turn_start`, then per block
/// `block_start`, `block_delta*`, `block_stop`, and finally exactly one of
/// `turn_complete` / `turn_error`. A (re)connecting subscriber first gets
/// one `block_catchup` per persisted block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "turn_start")]
    TurnStart { turn_id: TurnId, model: String },

    #[serde(rename = "block_start")]
    BlockStart {
        block_index: u32,
        block_type: BlockType,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },

    #[serde(rename = "block_delta")]
    BlockDelta {
        block_index: u32,
        delta_type: DeltaKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        text_delta: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature_delta: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        json_delta: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },

    #[serde(rename = "block_stop")]
    BlockStop { block_index: u32 },

    /// Replay of a persisted block, or of the in-progress block when
    /// `is_partial` is set.
    #[serde(rename = "block_catchup")]
    BlockCatchup {
        block_index: u32,
        block_type: BlockType,
        #[serde(skip_serializing_if = "Option::is_none")]
        text_content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<serde_json::Map<String, serde_json::Value>>,
        is_partial: bool,
    },

    #[serde(rename = "turn_complete")]
    TurnComplete {
        turn_id: TurnId,
        stop_reason: StopReason,
        input_tokens: u32,
        output_tokens: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_metadata: Option<serde_json::Value>,
    },

    #[serde(rename = "turn_error")]
    TurnError {
        turn_id: TurnId,
        error: String,
        is_cancelled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_block_index: Option<u32>,
    },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::BlockStart { .. } => "block_start",
            Self::BlockDelta { .. } => "block_delta",
            Self::BlockStop { .. } => "block_stop",
            Self::BlockCatchup { .. } => "block_catchup",
            Self::TurnComplete { .. } => "turn_complete",
            Self::TurnError { .. } => "turn_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::TurnError { .. })
    }

    /// Live `block_delta` for a provider delta. Deltas without a kind are
    /// treated as text.
    pub fn delta(delta: &BlockDelta) -> Self {
        Self::BlockDelta {
            block_index: delta.block_index,
            delta_type: delta.delta_type.unwrap_or(DeltaKind::TextDelta),
            text_delta: delta.text_delta.clone(),
            signature_delta: delta.signature_delta.clone(),
            json_delta: delta.json_delta.clone(),
            tool_use_id: delta.tool_use_id.clone(),
            tool_name: delta.tool_name.clone(),
        }
    }

    pub fn catchup(block: &TurnBlock, is_partial: bool) -> Self {
        Self::BlockCatchup {
            block_index: block.sequence,
            block_type: block.block_type,
            text_content: block.text_content.clone(),
            content: block.content.clone(),
            is_partial,
        }
    }

    pub fn complete(turn_id: TurnId, meta: &StreamMetadata) -> Self {
        Self::TurnComplete {
            turn_id,
            stop_reason: meta.stop_reason,
            input_tokens: meta.input_tokens,
            output_tokens: meta.output_tokens,
            response_metadata: meta.response_metadata.clone(),
        }
    }
}
