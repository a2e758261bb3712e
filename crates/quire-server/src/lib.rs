pub mod error;
pub mod handlers;
pub mod server;
pub mod service;

pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use service::{CreateTurnRequest, CreateTurnResponse, TurnBlockInput, TurnBlocksResponse, TurnService};
