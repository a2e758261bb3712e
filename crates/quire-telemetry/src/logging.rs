use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    span_name TEXT,
    turn_id TEXT,
    chat_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_turn ON logs(turn_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

/// A persisted log line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_name: Option<String>,
    pub turn_id: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub turn_id: Option<String>,
    pub chat_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite store for warn+ log events, keyed by the turn and chat they
/// belong to so a failed turn's diagnostics can be pulled up later.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn insert(&self, record: &PendingRecord) {
        let conn = self.conn.lock();
        // A failing log write has nowhere to be reported.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_name, turn_id, chat_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_name,
                record.ids.turn_id,
                record.ids.chat_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span_name, turn_id, chat_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        let mut push = |clause: &str, value: String| {
            params.push(value);
            sql.push_str(&format!(" AND {clause} ?{}", params.len()));
        };

        if let Some(level) = &q.level {
            push("level =", level.to_uppercase());
        }
        if let Some(target) = &q.target {
            push("target LIKE", format!("%{target}%"));
        }
        if let Some(turn_id) = &q.turn_id {
            push("turn_id =", turn_id.clone());
        }
        if let Some(chat_id) = &q.chat_id {
            push("chat_id =", chat_id.clone());
        }
        if let Some(since) = &q.since {
            push("timestamp >=", since.clone());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span_name: row.get(6)?,
                turn_id: row.get(7)?,
                chat_id: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn.lock().query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct PendingRecord {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_name: Option<String>,
    ids: CorrelationIds,
}

/// Identifiers that tie a log line to a conversation. Stored in span
/// extensions so events inherit them from any enclosing span.
#[derive(Clone, Debug, Default)]
struct CorrelationIds {
    turn_id: Option<String>,
    chat_id: Option<String>,
}

impl CorrelationIds {
    fn is_empty(&self) -> bool {
        self.turn_id.is_none() && self.chat_id.is_none()
    }

    fn fill_from(&mut self, other: &CorrelationIds) {
        if self.turn_id.is_none() {
            self.turn_id.clone_from(&other.turn_id);
        }
        if self.chat_id.is_none() {
            self.chat_id.clone_from(&other.chat_id);
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    ids: CorrelationIds,
}

impl FieldVisitor {
    fn string_field(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "turn_id" => self.ids.turn_id = Some(value),
            "chat_id" => self.ids.chat_id = Some(value),
            other => {
                self.fields.insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        self.string_field(field.name(), rendered.trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.string_field(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }
}

/// `tracing` layer forwarding WARN and ERROR events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.ids);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if visitor.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            match extensions.get_mut::<CorrelationIds>() {
                Some(existing) => {
                    let mut merged = visitor.ids;
                    merged.fill_from(existing);
                    *existing = merged;
                }
                None => extensions.insert(visitor.ids),
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut span_name = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                span_name.get_or_insert_with(|| span.name().to_string());
                if let Some(ids) = span.extensions().get::<CorrelationIds>() {
                    visitor.ids.fill_from(ids);
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&PendingRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            span_name,
            ids: visitor.ids,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture<F: FnOnce()>(f: F) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    #[test]
    fn info_events_are_not_persisted() {
        let sink = capture(|| {
            tracing::info!("routine");
            tracing::debug!("noise");
        });
        assert_eq!(sink.count().unwrap(), 0);
    }

    #[test]
    fn warn_event_fields_persisted() {
        let sink = capture(|| {
            tracing::warn!(turn_id = "turn_1", dropped = 3u64, "client queue full");
        });
        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.level, "WARN");
        assert_eq!(rec.message, "client queue full");
        assert_eq!(rec.turn_id.as_deref(), Some("turn_1"));
        assert!(rec.fields.as_deref().unwrap().contains("\"dropped\":3"));
    }

    #[test]
    fn ids_inherited_from_enclosing_span() {
        let sink = capture(|| {
            let span = tracing::info_span!("turn", turn_id = "turn_abc", chat_id = "chat_xyz");
            let _guard = span.enter();
            tracing::error!("provider failed");
        });
        let records = sink
            .query(&LogQuery {
                turn_id: Some("turn_abc".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].chat_id.as_deref(), Some("chat_xyz"));
        assert_eq!(records[0].span_name.as_deref(), Some("turn"));
    }

    #[test]
    fn late_recorded_span_field_is_picked_up() {
        let sink = capture(|| {
            let span = tracing::info_span!("turn", turn_id = tracing::field::Empty);
            span.record("turn_id", "turn_late");
            let _guard = span.enter();
            tracing::warn!("late");
        });
        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records[0].turn_id.as_deref(), Some("turn_late"));
    }

    #[test]
    fn query_filters_and_limit() {
        let sink = capture(|| {
            for i in 0..5 {
                tracing::warn!(turn_id = "turn_a", "warn {i}");
            }
            tracing::error!(turn_id = "turn_b", "boom");
        });
        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].turn_id.as_deref(), Some("turn_b"));

        let latest = sink
            .query(&LogQuery {
                turn_id: Some("turn_a".into()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].message, "warn 4");
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("quire-logs-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("logs.db");
        let sink = SqliteLogSink::new(&path).unwrap();
        assert_eq!(sink.count().unwrap(), 0);
        assert!(path.exists());
        drop(sink);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
