//! Fixtures shared by the engine's unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quire_core::{Role, StreamMetadata, Turn, TurnBlock, TurnId, TurnStatus};
use quire_store::{ChatRepo, Database, StoreError, TurnRepo, TurnRepository};

/// A fresh in-memory database holding one chat with one pending assistant turn.
pub fn repo_with_turn() -> (Arc<TurnRepo>, TurnId) {
    let db = Database::in_memory().unwrap();
    let chat = ChatRepo::new(db.clone()).create("test").unwrap();
    let repo = TurnRepo::new(db);
    let turn = Turn::new(chat.id, None, Role::Assistant);
    repo.create_turn(&turn).unwrap();
    (Arc::new(repo), turn.id)
}

/// Wraps a real repository and fails selected operations on demand.
pub struct FlakyRepo {
    inner: Arc<TurnRepo>,
    pub fail_blocks: AtomicBool,
    pub fail_metadata: AtomicBool,
}

impl FlakyRepo {
    pub fn new(inner: Arc<TurnRepo>) -> Self {
        Self {
            inner,
            fail_blocks: AtomicBool::new(false),
            fail_metadata: AtomicBool::new(false),
        }
    }

    fn injected(op: &str) -> StoreError {
        StoreError::Database(format!("injected {op} failure"))
    }
}

impl TurnRepository for FlakyRepo {
    fn create_turn_block(&self, block: &TurnBlock) -> Result<(), StoreError> {
        if self.fail_blocks.load(Ordering::SeqCst) {
            return Err(Self::injected("block"));
        }
        self.inner.create_turn_block(block)
    }

    fn update_turn_status(&self, turn_id: &TurnId, status: TurnStatus) -> Result<(), StoreError> {
        self.inner.update_turn_status(turn_id, status)
    }

    fn update_turn_error(&self, turn_id: &TurnId, message: &str) -> Result<(), StoreError> {
        self.inner.update_turn_error(turn_id, message)
    }

    fn update_turn_metadata(&self, turn_id: &TurnId, meta: &StreamMetadata) -> Result<(), StoreError> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(Self::injected("metadata"));
        }
        self.inner.update_turn_metadata(turn_id, meta)
    }

    fn get_turn_blocks(&self, turn_id: &TurnId) -> Result<Vec<TurnBlock>, StoreError> {
        self.inner.get_turn_blocks(turn_id)
    }
}
