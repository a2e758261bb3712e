pub mod errors;
pub mod events;
pub mod ids;
pub mod provider;
pub mod stream;
pub mod turns;

pub use errors::ProviderError;
pub use events::TurnEvent;
pub use ids::{BlockId, ChatId, ClientId, TurnId};
pub use provider::{GenerateRequest, GenerationParams, HistoryMessage, LlmProvider, ProviderStream, ThinkingConfig};
pub use stream::{BlockDelta, DeltaKind, ProviderEvent, StreamMetadata};
pub use turns::{BlockType, Role, StopReason, Turn, TurnBlock, TurnStatus};
