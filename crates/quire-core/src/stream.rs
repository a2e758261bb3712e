use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::turns::{BlockType, StopReason};

/// Events yielded by a provider stream. A well-formed stream is a run of
/// `Delta`s followed by exactly one `Metadata`. `Error` may appear at any
/// point and ends the stream.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Delta(BlockDelta),
    Metadata(StreamMetadata),
    Error(ProviderError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    TextDelta,
    ThinkingDelta,
    SignatureDelta,
    ToolCallStart,
    InputJsonDelta,
    UsageDelta,
}

impl DeltaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextDelta => "text_delta",
            Self::ThinkingDelta => "thinking_delta",
            Self::SignatureDelta => "signature_delta",
            Self::ToolCallStart => "tool_call_start",
            Self::InputJsonDelta => "input_json_delta",
            Self::UsageDelta => "usage_delta",
        }
    }
}

/// Incremental update to the block at `block_index`.
///
/// Deltas for one block are contiguous; a change of index means the
/// previous block is finished.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDelta {
    pub block_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_type: Option<BlockType>,
    pub delta_type: Option<DeltaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
}

impl BlockDelta {
    pub fn text(block_index: u32, text: impl Into<String>) -> Self {
        Self {
            block_index,
            delta_type: Some(DeltaKind::TextDelta),
            text_delta: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn thinking(block_index: u32, text: impl Into<String>) -> Self {
        Self {
            block_index,
            delta_type: Some(DeltaKind::ThinkingDelta),
            text_delta: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn signature(block_index: u32, signature: impl Into<String>) -> Self {
        Self {
            block_index,
            delta_type: Some(DeltaKind::SignatureDelta),
            signature_delta: Some(signature.into()),
            ..Default::default()
        }
    }

    /// Opens a tool-use block; carries its type so callers need not chain
    /// `with_block_type`.
    pub fn tool_call_start(block_index: u32, tool_use_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            block_index,
            block_type: Some(BlockType::ToolUse),
            delta_type: Some(DeltaKind::ToolCallStart),
            tool_use_id: Some(tool_use_id.into()),
            tool_name: Some(tool_name.into()),
            ..Default::default()
        }
    }

    pub fn input_json(block_index: u32, fragment: impl Into<String>) -> Self {
        Self {
            block_index,
            delta_type: Some(DeltaKind::InputJsonDelta),
            json_delta: Some(fragment.into()),
            ..Default::default()
        }
    }

    pub fn usage(block_index: u32, input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            block_index,
            delta_type: Some(DeltaKind::UsageDelta),
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
            ..Default::default()
        }
    }

    pub fn with_block_type(mut self, block_type: BlockType) -> Self {
        self.block_type = Some(block_type);
        self
    }
}

/// Terminal summary of a generation, produced once per stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_metadata: Option<serde_json::Value>,
}
