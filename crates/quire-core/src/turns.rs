use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, ChatId, TurnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle of a turn. `Complete`, `Error` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Streaming => write!(f, "streaming"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "streaming" => Ok(Self::Streaming),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown turn status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
            Self::ToolUse => "tool_use",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StopReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "end_turn" => Ok(Self::EndTurn),
            "max_tokens" => Ok(Self::MaxTokens),
            "stop_sequence" => Ok(Self::StopSequence),
            "tool_use" => Ok(Self::ToolUse),
            other => Err(format!("unknown stop reason: {other}")),
        }
    }
}

/// One message in a conversation branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub chat_id: ChatId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_turn_id: Option<TurnId>,
    pub role: Role,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Turn {
    /// A fresh turn in `pending` status.
    pub fn new(chat_id: ChatId, prev_turn_id: Option<TurnId>, role: Role) -> Self {
        Self {
            id: TurnId::new(),
            chat_id,
            prev_turn_id,
            role,
            status: TurnStatus::Pending,
            error: None,
            model: None,
            input_tokens: None,
            output_tokens: None,
            stop_reason: None,
            response_metadata: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "thinking" => Ok(Self::Thinking),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            other => Err(format!("unknown block type: {other}")),
        }
    }
}

/// One ordered, typed unit of a turn's content. Immutable once persisted.
///
/// `content` holds the type-specific fields: `signature` for thinking,
/// `tool_use_id` / `tool_name` / `input` for tool use, and `input_partial`
/// while tool input is still streaming.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnBlock {
    pub id: BlockId,
    pub turn_id: TurnId,
    pub block_type: BlockType,
    pub sequence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Map<String, serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

impl TurnBlock {
    pub fn text(turn_id: TurnId, sequence: u32, text: impl Into<String>) -> Self {
        Self {
            id: BlockId::new(),
            turn_id,
            block_type: BlockType::Text,
            sequence,
            text_content: Some(text.into()),
            content: None,
            created_at: Utc::now(),
        }
    }

    /// Look up a string field in the structured content.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.as_ref()?.get(key)?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TurnStatus::Pending.is_terminal());
        assert!(!TurnStatus::Streaming.is_terminal());
        assert!(TurnStatus::Complete.is_terminal());
        assert!(TurnStatus::Error.is_terminal());
        assert!(TurnStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_strings_match_serde() {
        for status in [
            TurnStatus::Pending,
            TurnStatus::Streaming,
            TurnStatus::Complete,
            TurnStatus::Error,
            TurnStatus::Cancelled,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json.as_str().unwrap(), status.to_string());
            assert_eq!(status.to_string().parse::<TurnStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_block_type_rejected() {
        assert!("image".parse::<BlockType>().is_err());
        assert_eq!("tool_use".parse::<BlockType>().unwrap(), BlockType::ToolUse);
    }

    #[test]
    fn new_turn_is_pending() {
        let turn = Turn::new(ChatId::new(), None, Role::Assistant);
        assert_eq!(turn.status, TurnStatus::Pending);
        assert!(turn.completed_at.is_none());
    }

    #[test]
    fn block_content_lookup() {
        let mut block = TurnBlock::text(TurnId::new(), 0, "hi");
        assert_eq!(block.content_str("signature"), None);
        let mut content = serde_json::Map::new();
        content.insert("signature".into(), "sig".into());
        block.content = Some(content);
        assert_eq!(block.content_str("signature"), Some("sig"));
    }
}
