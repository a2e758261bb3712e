use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use quire_core::ChatId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub const DEFAULT_TITLE: &str = "New Chat";
pub const MAX_TITLE_LEN: usize = 255;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: ChatId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChatRepo {
    db: Database,
}

impl ChatRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a chat. Blank titles fall back to the default, long ones are
    /// truncated on a character boundary.
    #[instrument(skip(self, title))]
    pub fn create(&self, title: &str) -> Result<ChatRow, StoreError> {
        let now = Utc::now();
        let row = ChatRow {
            id: ChatId::new(),
            title: normalize_title(title),
            created_at: now,
            updated_at: now,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chats (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    row.id.as_str(),
                    row.title,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(row)
    }

    #[instrument(skip(self), fields(chat_id = %id))]
    pub fn get(&self, id: &ChatId) -> Result<ChatRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, title, created_at, updated_at FROM chats WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_chat(row),
                None => Err(StoreError::NotFound(format!("chat {id}"))),
            }
        })
    }

    /// Most recently active chats first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<ChatRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at FROM chats
                 ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_chat(row)?);
            }
            Ok(results)
        })
    }

    /// Bump `updated_at`, e.g. when a new turn is added.
    #[instrument(skip(self), fields(chat_id = %id))]
    pub fn touch(&self, id: &ChatId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("chat {id}")));
            }
            Ok(())
        })
    }
}

/// Derive a chat title from the opening user message: its first few words,
/// or the default title when there is nothing usable.
pub fn title_from_text(text: &str) -> String {
    const TITLE_WORDS: usize = 6;
    let words: Vec<&str> = text.split_whitespace().take(TITLE_WORDS).collect();
    normalize_title(&words.join(" "))
}

fn normalize_title(title: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    trimmed.chars().take(MAX_TITLE_LEN).collect()
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> Result<ChatRow, StoreError> {
    let created: String = row_helpers::get(row, 2, "chats", "created_at")?;
    let updated: String = row_helpers::get(row, 3, "chats", "updated_at")?;
    Ok(ChatRow {
        id: ChatId::from_raw(row_helpers::get::<String>(row, 0, "chats", "id")?),
        title: row_helpers::get(row, 1, "chats", "title")?,
        created_at: row_helpers::parse_time(&created, "chats", "created_at")?,
        updated_at: row_helpers::parse_time(&updated, "chats", "updated_at")?,
    })
}
