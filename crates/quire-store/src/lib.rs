pub mod chats;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod turns;

pub use chats::{ChatRepo, ChatRow};
pub use database::Database;
pub use error::StoreError;
pub use turns::{TurnRepo, TurnRepository};
