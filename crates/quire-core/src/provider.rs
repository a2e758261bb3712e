use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::stream::ProviderEvent;
use crate::turns::{Role, TurnBlock};

pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Generation knobs forwarded to the provider. Missing fields take their
/// defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub thinking: ThinkingConfig,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: None,
            thinking: ThinkingConfig::Disabled,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ThinkingConfig {
    #[default]
    Disabled,
    Enabled { budget_tokens: u32 },
}

impl ThinkingConfig {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

/// One prior turn in the branch being continued, oldest first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub blocks: Vec<TurnBlock>,
}

impl HistoryMessage {
    /// Concatenated text of the message's text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| b.text_content.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub params: GenerationParams,
}

/// A streaming LLM backend.
///
/// Implementations must stop producing events promptly once `cancel` fires.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supports_model(&self, model: &str) -> bool;

    async fn stream_response(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;
}
