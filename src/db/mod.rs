use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::attachments::files::unique_target;
use crate::error::AppError;
use crate::models::{AnnotatedMessage, LogEntry, Peer, StorageInfo};

pub const MESSAGE_EVENT: &str = "message";
pub const INVITE_EVENT: &str = "invite";

const EVENT_COLUMNS: &str = "id, created_at, event_type, peer_id, peer_title, from_id, from_name, \
     message_id, reply_to, is_bot, text, attachments, payload";

/// Columns added after the first release, with their declarations.
const LATE_COLUMNS: [(&str, &str); 3] = [
    ("is_bot", "INTEGER NOT NULL DEFAULT 0"),
    ("peer_title", "TEXT"),
    ("from_name", "TEXT"),
];

/// Append-only SQLite log of platform events.
pub struct EventLog {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl EventLog {
    pub fn open(db_path: PathBuf) -> Result<Self, AppError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        migrate(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AppError> {
        self.conn.lock().map_err(|_| AppError::LockPoisoned)
    }

    /// Store a normalized message. The `attachments` column holds the whole
    /// tree flattened; the payload keeps the nested structure.
    pub fn log_message(
        &self,
        message: &AnnotatedMessage,
        peer_title: Option<&str>,
        from_name: Option<&str>,
    ) -> Result<i64, AppError> {
        let payload = serde_json::to_value(message)?;
        let attachments = serde_json::to_value(message.flatten_attachments())?;
        self.insert(MESSAGE_EVENT, &payload, &attachments, peer_title, from_name)
    }

    /// Store any other event with its raw payload.
    pub fn log_event(
        &self,
        event_type: &str,
        payload: &Value,
        peer_title: Option<&str>,
        from_name: Option<&str>,
    ) -> Result<i64, AppError> {
        let attachments = payload
            .get("attachments")
            .filter(|value| value.is_array())
            .cloned()
            .unwrap_or_else(|| json!([]));
        self.insert(event_type, payload, &attachments, peer_title, from_name)
    }

    fn insert(
        &self,
        event_type: &str,
        payload: &Value,
        attachments: &Value,
        peer_title: Option<&str>,
        from_name: Option<&str>,
    ) -> Result<i64, AppError> {
        let peer_id = payload.get("peer_id").and_then(Value::as_i64);
        let from_id = payload.get("from_id").and_then(Value::as_i64);
        let message_id = payload.get("id").and_then(Value::as_i64);
        let reply_to = payload
            .get("reply_message")
            .and_then(|reply| reply.get("from_id"))
            .and_then(Value::as_i64);
        let text = payload.get("text").and_then(Value::as_str);
        let is_bot = from_id.is_some_and(|id| id < 0);

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (created_at, event_type, peer_id, peer_title, from_id, from_name,
                                 message_id, reply_to, is_bot, text, attachments, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                now_iso(),
                event_type,
                peer_id,
                peer_title,
                from_id,
                from_name,
                message_id,
                reply_to,
                is_bot,
                text,
                attachments.to_string(),
                payload.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest stored messages, optionally for one peer.
    pub fn fetch_messages(&self, peer_id: Option<i64>, limit: usize) -> Result<Vec<LogEntry>, AppError> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE event_type = ?1 AND (?2 IS NULL OR peer_id = ?2)
             ORDER BY id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![MESSAGE_EVENT, peer_id, limit], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>, AppError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT peer_id, MAX(peer_title) FROM events
             WHERE peer_id IS NOT NULL
             GROUP BY peer_id
             ORDER BY peer_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Peer {
                id: row.get(0)?,
                title: row.get(1)?,
            })
        })?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    pub fn describe_storage(&self) -> StorageInfo {
        let metadata = fs::metadata(&self.db_path).ok();
        StorageInfo {
            path: self.db_path.to_string_lossy().to_string(),
            exists: metadata.is_some(),
            size_bytes: metadata.map(|m| m.len()).unwrap_or(0),
        }
    }

    /// Write every stored event into `backups/vk-monitor-backup-<ts>.zip`
    /// next to the database and return the archive path.
    pub fn export_backup_zip(&self) -> Result<PathBuf, AppError> {
        let events = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_entry)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            events
        };

        let backup_dir = self
            .db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("backups");
        fs::create_dir_all(&backup_dir)?;

        let file_name = format!(
            "vk-monitor-backup-{}.zip",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let backup_path = unique_target(&backup_dir, &file_name);

        let file = File::options().write(true).create_new(true).open(&backup_path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file("backup.jsonl", options)?;

        let mut lines = Vec::with_capacity(events.len() + 1);
        lines.push(
            json!({
                "type": "meta",
                "schema_version": 1,
                "generated_at": now_iso(),
                "events": events.len(),
            })
            .to_string(),
        );
        for event in &events {
            lines.push(json!({"type": "event", "payload": event}).to_string());
        }

        zip.write_all(lines.join("\n").as_bytes())?;
        zip.finish()?;

        info!("backup written to {}", backup_path.display());
        Ok(backup_path)
    }
}

fn migrate(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          created_at TEXT NOT NULL,
          event_type TEXT NOT NULL,
          peer_id INTEGER,
          from_id INTEGER,
          message_id INTEGER,
          reply_to INTEGER,
          text TEXT,
          attachments TEXT NOT NULL DEFAULT '[]',
          payload TEXT NOT NULL
        );
        "#,
    )?;

    for (column, declaration) in LATE_COLUMNS {
        let present = conn
            .prepare(&format!("SELECT {column} FROM events LIMIT 0"))
            .is_ok();
        if !present {
            conn.execute_batch(&format!("ALTER TABLE events ADD COLUMN {column} {declaration};"))?;
            info!("migration: added {column} column to events");
        }
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_events_type_peer ON events(event_type, peer_id, id);",
    )?;
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let attachments: String = row.get(11)?;
    let payload: String = row.get(12)?;
    Ok(LogEntry {
        id: row.get(0)?,
        created_at: row.get(1)?,
        event_type: row.get(2)?,
        peer_id: row.get(3)?,
        peer_title: row.get(4)?,
        from_id: row.get(5)?,
        from_name: row.get(6)?,
        message_id: row.get(7)?,
        reply_to: row.get(8)?,
        is_bot: row.get(9)?,
        text: row.get(10)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_else(|_| json!([])),
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
    })
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
