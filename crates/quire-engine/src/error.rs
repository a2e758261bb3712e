use quire_core::{ClientId, ProviderError, TurnId};
use quire_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid tool input in block {sequence}: {source}")]
    MalformedToolInput {
        sequence: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected delta for block {expected}, got block {got}")]
    OutOfOrderDelta { expected: u32, got: u32 },

    #[error("stream ended unexpectedly")]
    StreamEndedUnexpectedly,

    #[error("turn {0} already started")]
    AlreadyStarted(TurnId),

    #[error("turn {0} already has an executor")]
    AlreadyRegistered(TurnId),

    #[error("client {0} not attached")]
    ClientNotFound(ClientId),

    #[error("turn worker panicked: {0}")]
    WorkerPanicked(String),
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Provider(e) => e.error_kind(),
            Self::Store(_) => "store",
            Self::MalformedToolInput { .. } => "malformed_tool_input",
            Self::OutOfOrderDelta { .. } => "out_of_order_delta",
            Self::StreamEndedUnexpectedly => "stream_ended_unexpectedly",
            Self::AlreadyStarted(_) => "already_started",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::ClientNotFound(_) => "client_not_found",
            Self::WorkerPanicked(_) => "worker_panicked",
        }
    }
}
