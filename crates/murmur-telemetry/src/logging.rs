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

/// A warn+ log line persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub conversation_id: Option<String>,
    pub conn_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub conversation_id: Option<String>,
    pub conn_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 conversation_id TEXT,
                 conn_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_conversation ON logs(conversation_id);
             CREATE INDEX IF NOT EXISTS idx_logs_conn ON logs(conn_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &LogEntry) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, conversation_id, conn_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.conversation_id,
                entry.conn_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, conversation_id, conn_id
             FROM logs WHERE 1=1",
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
        if let Some(conversation_id) = &q.conversation_id {
            push("conversation_id =", conversation_id.clone());
        }
        if let Some(conn_id) = &q.conn_id {
            push("conn_id =", conn_id.clone());
        }
        if let Some(since) = &q.since {
            push("timestamp >=", since.clone());
        }

        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                conversation_id: row.get(6)?,
                conn_id: row.get(7)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }

    /// Delete all but the newest `keep` rows. Returns the number removed.
    pub fn retain_latest(&self, keep: u32) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM logs WHERE id NOT IN (SELECT id FROM logs ORDER BY id DESC LIMIT ?1)",
            [keep],
        )
    }
}

struct LogEntry {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    conversation_id: Option<String>,
    conn_id: Option<String>,
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    conversation_id: Option<String>,
    conn_id: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "conversation_id" => self.conversation_id = Some(value),
            "conn_id" => self.conn_id = Some(value),
            _ => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = match field.name() {
            "message" => rendered,
            _ => rendered.trim_matches('"').to_string(),
        };
        self.put(field.name(), rendered);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), value.into());
    }
}

/// Stored on spans so child events inherit conversation / connection ids.
struct SpanIds {
    conversation_id: Option<String>,
    conn_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.conversation_id.is_none() || visitor.conn_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(ids) = extensions.get::<SpanIds>() {
                        if visitor.conversation_id.is_none() {
                            visitor.conversation_id.clone_from(&ids.conversation_id);
                        }
                        if visitor.conn_id.is_none() {
                            visitor.conn_id.clone_from(&ids.conn_id);
                        }
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            conversation_id: visitor.conversation_id,
            conn_id: visitor.conn_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.conversation_id.is_some() || visitor.conn_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanIds {
                    conversation_id: visitor.conversation_id,
                    conn_id: visitor.conn_id,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;

    fn sink(dir: &TempDir) -> Arc<SqliteLogSink> {
        Arc::new(SqliteLogSink::new(&dir.path().join("logs.db")).unwrap())
    }

    fn entry(level: &str, message: &str, conversation: Option<&str>) -> LogEntry {
        LogEntry {
            timestamp: "2026-03-01T12:00:00Z".into(),
            level: level.into(),
            target: "murmur_server::hub".into(),
            message: message.into(),
            fields: None,
            conversation_id: conversation.map(str::to_owned),
            conn_id: None,
        }
    }

    #[test]
    fn layer_persists_only_warn_and_above() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("ignored");
            tracing::warn!(conversation_id = "c1", tail = 4, "stale append");
            tracing::error!("broken");
        });

        assert_eq!(sink.count().unwrap(), 2);
        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows[0].message, "broken");
        assert_eq!(rows[1].message, "stale append");
        assert_eq!(rows[1].conversation_id.as_deref(), Some("c1"));
        assert_eq!(rows[1].fields.as_deref(), Some(r#"{"tail":4}"#));
    }

    #[test]
    fn layer_inherits_ids_from_span() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("connection", conn_id = "conn_1");
            let _enter = span.enter();
            tracing::warn!("send queue full");
        });

        let rows = sink
            .query(&LogQuery {
                conn_id: Some("conn_1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "send queue full");
    }

    #[test]
    fn query_filters_by_level_and_conversation() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        sink.insert(&entry("WARN", "a", Some("c1")));
        sink.insert(&entry("ERROR", "b", Some("c2")));
        sink.insert(&entry("WARN", "c", Some("c2")));

        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "b");

        let c2 = sink
            .query(&LogQuery {
                conversation_id: Some("c2".into()),
                level: Some("WARN".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(c2.len(), 1);
        assert_eq!(c2[0].message, "c");
    }

    #[test]
    fn query_since_and_limit() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        for i in 0..10 {
            let mut e = entry("WARN", &format!("msg {i}"), None);
            e.timestamp = format!("2026-03-01T12:00:{i:02}Z");
            sink.insert(&e);
        }

        let recent = sink
            .query(&LogQuery {
                since: Some("2026-03-01T12:00:05Z".into()),
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        let messages: Vec<_> = recent.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["msg 9", "msg 8", "msg 7"]);
    }

    #[test]
    fn retain_latest_prunes_oldest() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir);
        for i in 0..5 {
            sink.insert(&entry("WARN", &format!("msg {i}"), None));
        }
        assert_eq!(sink.retain_latest(2).unwrap(), 3);
        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].message, "msg 3");
    }
}
