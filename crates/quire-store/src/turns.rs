use chrono::Utc;
use tracing::{instrument, warn};

use quire_core::{BlockId, ChatId, StreamMetadata, Turn, TurnBlock, TurnId, TurnStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// The narrow persistence surface a streaming turn needs.
///
/// Status writes are monotonic: once a turn is terminal, further status
/// changes are rejected with `Conflict`.
pub trait TurnRepository: Send + Sync {
    /// Insert one block. A second block with the same `(turn_id, sequence)`
    /// is a `Conflict`.
    fn create_turn_block(&self, block: &TurnBlock) -> Result<(), StoreError>;

    /// Set the status, stamping `completed_at` for terminal statuses.
    fn update_turn_status(&self, turn_id: &TurnId, status: TurnStatus) -> Result<(), StoreError>;

    /// Mark the turn failed with `message`.
    fn update_turn_error(&self, turn_id: &TurnId, message: &str) -> Result<(), StoreError>;

    /// Record model, token counts, stop reason and provider metadata.
    fn update_turn_metadata(&self, turn_id: &TurnId, meta: &StreamMetadata) -> Result<(), StoreError>;

    /// All persisted blocks of a turn, ordered by sequence.
    fn get_turn_blocks(&self, turn_id: &TurnId) -> Result<Vec<TurnBlock>, StoreError>;
}

const TURN_COLUMNS: &str = "id, chat_id, prev_turn_id, role, status, error, model, input_tokens, output_tokens,
     stop_reason, response_metadata, created_at, completed_at";

const TERMINAL_GUARD: &str = "status NOT IN ('complete', 'error', 'cancelled')";

#[derive(Clone)]
pub struct TurnRepo {
    db: Database,
}

impl TurnRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, turn), fields(turn_id = %turn.id, chat_id = %turn.chat_id, role = %turn.role))]
    pub fn create_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        let metadata = turn.response_metadata.as_ref().map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO turns (id, chat_id, prev_turn_id, role, status, error, model, input_tokens,
                                    output_tokens, stop_reason, response_metadata, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    turn.id.as_str(),
                    turn.chat_id.as_str(),
                    turn.prev_turn_id.as_ref().map(|t| t.as_str()),
                    turn.role.to_string(),
                    turn.status.to_string(),
                    turn.error,
                    turn.model,
                    turn.input_tokens,
                    turn.output_tokens,
                    turn.stop_reason.map(|r| r.as_str()),
                    metadata,
                    turn.created_at.to_rfc3339(),
                    turn.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    /// Persist a turn together with its initial blocks in one transaction.
    #[instrument(skip(self, turn, blocks), fields(turn_id = %turn.id, blocks = blocks.len()))]
    pub fn create_turn_with_blocks(&self, turn: &Turn, blocks: &[TurnBlock]) -> Result<(), StoreError> {
        let metadata = turn.response_metadata.as_ref().map(serde_json::to_string).transpose()?;
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO turns (id, chat_id, prev_turn_id, role, status, model, response_metadata,
                                    created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    turn.id.as_str(),
                    turn.chat_id.as_str(),
                    turn.prev_turn_id.as_ref().map(|t| t.as_str()),
                    turn.role.to_string(),
                    turn.status.to_string(),
                    turn.model,
                    metadata,
                    turn.created_at.to_rfc3339(),
                    turn.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            for block in blocks {
                insert_block(tx, block)?;
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(turn_id = %id))]
    pub fn get_turn(&self, id: &TurnId) -> Result<Turn, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_turn(row),
                None => Err(StoreError::NotFound(format!("turn {id}"))),
            }
        })
    }

    /// Every turn of a chat across all branches, oldest first.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn list_turns(&self, chat_id: &ChatId) -> Result<Vec<Turn>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_COLUMNS} FROM turns WHERE chat_id = ?1 ORDER BY created_at, id"
            ))?;
            let mut rows = stmt.query([chat_id.as_str()])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(row_to_turn(row)?);
            }
            Ok(turns)
        })
    }

    /// The branch ending at `leaf`, root first, following `prev_turn_id`.
    #[instrument(skip(self), fields(turn_id = %leaf))]
    pub fn ancestry(&self, leaf: &TurnId) -> Result<Vec<Turn>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "WITH RECURSIVE branch(id, depth) AS (
                     SELECT id, 0 FROM turns WHERE id = ?1
                     UNION ALL
                     SELECT t.prev_turn_id, b.depth + 1 FROM turns t JOIN branch b ON t.id = b.id
                     WHERE t.prev_turn_id IS NOT NULL
                 )
                 SELECT {TURN_COLUMNS} FROM turns JOIN branch USING (id) ORDER BY branch.depth DESC"
            ))?;
            let mut rows = stmt.query([leaf.as_str()])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(row_to_turn(row)?);
            }
            if turns.is_empty() {
                return Err(StoreError::NotFound(format!("turn {leaf}")));
            }
            Ok(turns)
        })
    }

    /// Insert several blocks atomically.
    #[instrument(skip(self, blocks), fields(count = blocks.len()))]
    pub fn create_turn_blocks(&self, blocks: &[TurnBlock]) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            for block in blocks {
                insert_block(tx, block)?;
            }
            Ok(())
        })
    }

    fn guarded_update(
        &self,
        turn_id: &TurnId,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(sql, params)?;
            if changed > 0 {
                return Ok(());
            }
            let status: Option<String> = conn
                .query_row("SELECT status FROM turns WHERE id = ?1", [turn_id.as_str()], |row| row.get(0))
                .ok();
            match status {
                None => Err(StoreError::NotFound(format!("turn {turn_id}"))),
                Some(status) => {
                    warn!(turn_id = %turn_id, status, "rejected update of terminal turn");
                    Err(StoreError::Conflict(format!("turn {turn_id} is already {status}")))
                }
            }
        })
    }
}

impl TurnRepository for TurnRepo {
    #[instrument(skip(self, block), fields(turn_id = %block.turn_id, sequence = block.sequence, block_type = %block.block_type))]
    fn create_turn_block(&self, block: &TurnBlock) -> Result<(), StoreError> {
        self.db.with_conn(|conn| insert_block(conn, block))
    }

    #[instrument(skip(self), fields(turn_id = %turn_id, status = %status))]
    fn update_turn_status(&self, turn_id: &TurnId, status: TurnStatus) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let status = status.to_string();
        self.guarded_update(
            turn_id,
            &format!(
                "UPDATE turns SET status = ?1, completed_at = COALESCE(?2, completed_at)
                 WHERE id = ?3 AND {TERMINAL_GUARD}"
            ),
            rusqlite::params![status, completed_at, turn_id.as_str()],
        )
    }

    #[instrument(skip(self, message), fields(turn_id = %turn_id))]
    fn update_turn_error(&self, turn_id: &TurnId, message: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.guarded_update(
            turn_id,
            &format!(
                "UPDATE turns SET status = 'error', error = ?1, completed_at = ?2
                 WHERE id = ?3 AND {TERMINAL_GUARD}"
            ),
            rusqlite::params![message, now, turn_id.as_str()],
        )
    }

    #[instrument(skip(self, meta), fields(turn_id = %turn_id, model = %meta.model))]
    fn update_turn_metadata(&self, turn_id: &TurnId, meta: &StreamMetadata) -> Result<(), StoreError> {
        let response_metadata = meta.response_metadata.as_ref().map(serde_json::to_string).transpose()?;
        let now = Utc::now().to_rfc3339();
        self.guarded_update(
            turn_id,
            &format!(
                "UPDATE turns SET model = ?1, input_tokens = ?2, output_tokens = ?3, stop_reason = ?4,
                        response_metadata = ?5, completed_at = ?6
                 WHERE id = ?7 AND {TERMINAL_GUARD}"
            ),
            rusqlite::params![
                meta.model,
                meta.input_tokens,
                meta.output_tokens,
                meta.stop_reason.as_str(),
                response_metadata,
                now,
                turn_id.as_str(),
            ],
        )
    }

    #[instrument(skip(self), fields(turn_id = %turn_id))]
    fn get_turn_blocks(&self, turn_id: &TurnId) -> Result<Vec<TurnBlock>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, turn_id, block_type, sequence, text_content, content, created_at
                 FROM turn_blocks WHERE turn_id = ?1 ORDER BY sequence",
            )?;
            let mut rows = stmt.query([turn_id.as_str()])?;
            let mut blocks = Vec::new();
            while let Some(row) = rows.next()? {
                blocks.push(row_to_block(row)?);
            }
            Ok(blocks)
        })
    }
}

fn insert_block(conn: &rusqlite::Connection, block: &TurnBlock) -> Result<(), StoreError> {
    let content = block.content.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO turn_blocks (id, turn_id, block_type, sequence, text_content, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            block.id.as_str(),
            block.turn_id.as_str(),
            block.block_type.as_str(),
            block.sequence,
            block.text_content,
            content,
            block.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<Turn, StoreError> {
    let role: String = row_helpers::get(row, 3, "turns", "role")?;
    let status: String = row_helpers::get(row, 4, "turns", "status")?;
    let stop_reason: Option<String> = row_helpers::get_opt(row, 9, "turns", "stop_reason")?;
    let metadata: Option<String> = row_helpers::get_opt(row, 10, "turns", "response_metadata")?;
    let created: String = row_helpers::get(row, 11, "turns", "created_at")?;
    let completed: Option<String> = row_helpers::get_opt(row, 12, "turns", "completed_at")?;

    Ok(Turn {
        id: TurnId::from_raw(row_helpers::get::<String>(row, 0, "turns", "id")?),
        chat_id: ChatId::from_raw(row_helpers::get::<String>(row, 1, "turns", "chat_id")?),
        prev_turn_id: row_helpers::get_opt::<String>(row, 2, "turns", "prev_turn_id")?.map(TurnId::from_raw),
        role: row_helpers::parse_enum(&role, "turns", "role")?,
        status: row_helpers::parse_enum(&status, "turns", "status")?,
        error: row_helpers::get_opt(row, 5, "turns", "error")?,
        model: row_helpers::get_opt(row, 6, "turns", "model")?,
        input_tokens: row_helpers::get_opt(row, 7, "turns", "input_tokens")?,
        output_tokens: row_helpers::get_opt(row, 8, "turns", "output_tokens")?,
        stop_reason: stop_reason
            .map(|s| row_helpers::parse_enum(&s, "turns", "stop_reason"))
            .transpose()?,
        response_metadata: metadata
            .map(|m| row_helpers::parse_json(&m, "turns", "response_metadata"))
            .transpose()?,
        created_at: row_helpers::parse_time(&created, "turns", "created_at")?,
        completed_at: completed
            .map(|c| row_helpers::parse_time(&c, "turns", "completed_at"))
            .transpose()?,
    })
}

fn row_to_block(row: &rusqlite::Row<'_>) -> Result<TurnBlock, StoreError> {
    let block_type: String = row_helpers::get(row, 2, "turn_blocks", "block_type")?;
    let content: Option<String> = row_helpers::get_opt(row, 5, "turn_blocks", "content")?;
    let created: String = row_helpers::get(row, 6, "turn_blocks", "created_at")?;

    let content = match content {
        Some(raw) => match row_helpers::parse_json(&raw, "turn_blocks", "content")? {
            serde_json::Value::Object(map) => Some(map),
            other => {
                return Err(StoreError::CorruptRow {
                    table: "turn_blocks",
                    column: "content",
                    detail: format!("expected object, got {other}"),
                })
            }
        },
        None => None,
    };

    Ok(TurnBlock {
        id: BlockId::from_raw(row_helpers::get::<String>(row, 0, "turn_blocks", "id")?),
        turn_id: TurnId::from_raw(row_helpers::get::<String>(row, 1, "turn_blocks", "turn_id")?),
        block_type: row_helpers::parse_enum(&block_type, "turn_blocks", "block_type")?,
        sequence: row_helpers::get(row, 3, "turn_blocks", "sequence")?,
        text_content: row_helpers::get_opt(row, 4, "turn_blocks", "text_content")?,
        content,
        created_at: row_helpers::parse_time(&created, "turn_blocks", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chats::ChatRepo;
    use quire_core::{BlockType, Role, StopReason};
    use serde_json::json;

    fn setup() -> (TurnRepo, ChatId) {
        let db = Database::in_memory().unwrap();
        let chat = ChatRepo::new(db.clone()).create("test").unwrap();
        (TurnRepo::new(db), chat.id)
    }

    fn assistant_turn(repo: &TurnRepo, chat_id: &ChatId) -> Turn {
        let turn = Turn::new(chat_id.clone(), None, Role::Assistant);
        repo.create_turn(&turn).unwrap();
        turn
    }

    #[test]
    fn create_and_get_turn() {
        let (repo, chat_id) = setup();
        let turn = assistant_turn(&repo, &chat_id);
        let fetched = repo.get_turn(&turn.id).unwrap();
        assert_eq!(fetched.id, turn.id);
        assert_eq!(fetched.role, Role::Assistant);
        assert_eq!(fetched.status, TurnStatus::Pending);
    }

    #[test]
    fn blocks_come_back_in_sequence_order() {
        let (repo, chat_id) = setup();
        let turn = assistant_turn(&repo, &chat_id);
        repo.create_turn_block(&TurnBlock::text(turn.id.clone(), 1, "second")).unwrap();
        repo.create_turn_block(&TurnBlock::text(turn.id.clone(), 0, "first")).unwrap();

        let blocks = repo.get_turn_blocks(&turn.id).unwrap();
        let seqs: Vec<u32> = blocks.iter().map(|b| b.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(blocks[0].text_content.as_deref(), Some("first"));
    }

    #[test]
    fn duplicate_sequence_is_conflict() {
        let (repo, chat_id) = setup();
        let turn = assistant_turn(&repo, &chat_id);
        repo.create_turn_block(&TurnBlock::text(turn.id.clone(), 0, "a")).unwrap();
        let err = repo.create_turn_block(&TurnBlock::text(turn.id.clone(), 0, "b")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn structured_content_roundtrips() {
        let (repo, chat_id) = setup();
        let turn = assistant_turn(&repo, &chat_id);
        let mut block = TurnBlock::text(turn.id.clone(), 0, "");
        block.block_type = BlockType::ToolUse;
        block.text_content = None;
        block.content = json!({"tool_use_id": "tu_1", "tool_name": "doc_view", "input": {"doc_id": "d1"}})
            .as_object()
            .cloned();
        repo.create_turn_block(&block).unwrap();

        let stored = &repo.get_turn_blocks(&turn.id).unwrap()[0];
        assert_eq!(stored.block_type, BlockType::ToolUse);
        assert_eq!(stored.content_str("tool_name"), Some("doc_view"));
        assert_eq!(stored.content.as_ref().unwrap()["input"]["doc_id"], "d1");
    }

    #[test]
    fn terminal_status_stamps_completion_and_sticks() {
        let (repo, chat_id) = setup();
        let turn = assistant_turn(&repo, &chat_id);
        repo.update_turn_status(&turn.id, TurnStatus::Streaming).unwrap();
        assert!(repo.get_turn(&turn.id).unwrap().completed_at.is_none());

        repo.update_turn_status(&turn.id, TurnStatus::Cancelled).unwrap();
        let fetched = repo.get_turn(&turn.id).unwrap();
        assert_eq!(fetched.status, TurnStatus::Cancelled);
        assert!(fetched.completed_at.is_some());

        let err = repo.update_turn_status(&turn.id, TurnStatus::Complete).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(repo.get_turn(&turn.id).unwrap().status, TurnStatus::Cancelled);
    }

    #[test]
    fn error_update_records_message() {
        let (repo, chat_id) = setup();
        let turn = assistant_turn(&repo, &chat_id);
        repo.update_turn_error(&turn.id, "provider overloaded").unwrap();
        let fetched = repo.get_turn(&turn.id).unwrap();
        assert_eq!(fetched.status, TurnStatus::Error);
        assert_eq!(fetched.error.as_deref(), Some("provider overloaded"));
    }

    #[test]
    fn metadata_update() {
        let (repo, chat_id) = setup();
        let turn = assistant_turn(&repo, &chat_id);
        let meta = StreamMetadata {
            model: "lorem-fast".into(),
            input_tokens: 12,
            output_tokens: 34,
            stop_reason: StopReason::MaxTokens,
            response_metadata: Some(json!({"mock": true})),
        };
        repo.update_turn_metadata(&turn.id, &meta).unwrap();
        let fetched = repo.get_turn(&turn.id).unwrap();
        assert_eq!(fetched.model.as_deref(), Some("lorem-fast"));
        assert_eq!(fetched.input_tokens, Some(12));
        assert_eq!(fetched.output_tokens, Some(34));
        assert_eq!(fetched.stop_reason, Some(StopReason::MaxTokens));
        assert_eq!(fetched.response_metadata, Some(json!({"mock": true})));
    }

    #[test]
    fn updates_on_missing_turn_are_not_found() {
        let (repo, _) = setup();
        let err = repo.update_turn_status(&TurnId::from_raw("turn_x"), TurnStatus::Streaming).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn ancestry_walks_to_root() {
        let (repo, chat_id) = setup();
        let root = Turn::new(chat_id.clone(), None, Role::User);
        repo.create_turn(&root).unwrap();
        let reply = Turn::new(chat_id.clone(), Some(root.id.clone()), Role::Assistant);
        repo.create_turn(&reply).unwrap();
        let follow_up = Turn::new(chat_id.clone(), Some(reply.id.clone()), Role::User);
        repo.create_turn(&follow_up).unwrap();
        // A sibling branch that must not appear in the path.
        let sibling = Turn::new(chat_id.clone(), Some(root.id.clone()), Role::Assistant);
        repo.create_turn(&sibling).unwrap();

        let path: Vec<TurnId> = repo.ancestry(&follow_up.id).unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(path, vec![root.id, reply.id, follow_up.id]);
        assert_eq!(repo.list_turns(&chat_id).unwrap().len(), 4);
    }

    #[test]
    fn turn_with_blocks_is_atomic() {
        let (repo, chat_id) = setup();
        let turn = Turn::new(chat_id, None, Role::User);
        let blocks = vec![
            TurnBlock::text(turn.id.clone(), 0, "a"),
            TurnBlock::text(turn.id.clone(), 0, "duplicate"),
        ];
        assert!(repo.create_turn_with_blocks(&turn, &blocks).is_err());
        assert!(matches!(repo.get_turn(&turn.id), Err(StoreError::NotFound(_))));
    }
}
