//! Shared fixture: a throwaway chat log with the tables the mirror reads
#![allow(dead_code)]

use chatmirror_core::bridge::{OutboundBridge, OutboundMessage};
use chatmirror_core::{Config, Mirror, MirrorError};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SCHEMA: &str = "
CREATE TABLE handle (
    ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    service TEXT DEFAULT 'iMessage'
);
CREATE TABLE chat (
    ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT,
    chat_identifier TEXT,
    service_name TEXT,
    display_name TEXT
);
CREATE TABLE message (
    ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT,
    text,
    handle_id INTEGER DEFAULT 0,
    service TEXT DEFAULT 'iMessage',
    is_from_me INTEGER DEFAULT 0,
    cache_has_attachments INTEGER DEFAULT 0,
    is_delivered INTEGER DEFAULT 1,
    is_read INTEGER DEFAULT 0,
    date INTEGER DEFAULT 0,
    date_delivered INTEGER DEFAULT 0,
    date_read INTEGER DEFAULT 0
);
CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER, message_date INTEGER DEFAULT 0);
CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);
CREATE TABLE attachment (
    ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT,
    mime_type TEXT,
    transfer_state INTEGER DEFAULT 5,
    total_bytes INTEGER DEFAULT 0,
    created_date INTEGER DEFAULT 0
);
CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
";

pub struct ChatDb {
    pub dir: TempDir,
    pub path: PathBuf,
    conn: Connection,
}

impl ChatDb {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        Self { dir, path, conn }
    }

    pub fn add_handle(&self, id: &str) -> i64 {
        self.conn
            .execute("INSERT INTO handle (id) VALUES (?1)", params![id])
            .unwrap();
        self.conn.last_insert_rowid()
    }

    /// A conversation; `handles` become its recipients
    pub fn add_chat(&self, identifier: &str, display_name: Option<&str>, handles: &[i64]) -> i64 {
        let style = if identifier.starts_with("chat") { '+' } else { '-' };
        self.conn
            .execute(
                "INSERT INTO chat (guid, chat_identifier, service_name, display_name)
                 VALUES (?1, ?2, 'iMessage', ?3)",
                params![format!("iMessage;{};{}", style, identifier), identifier, display_name],
            )
            .unwrap();
        let chat = self.conn.last_insert_rowid();
        for handle in handles {
            self.conn
                .execute(
                    "INSERT INTO chat_handle_join (chat_id, handle_id) VALUES (?1, ?2)",
                    params![chat, handle],
                )
                .unwrap();
        }
        chat
    }

    /// A message in `chat`; `handle: None` means sent by the local user
    pub fn add_message(&self, chat: i64, handle: Option<i64>, text: Option<&str>, date: i64) -> i64 {
        self.conn
            .execute(
                "INSERT INTO message (guid, text, handle_id, is_from_me, date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    format!("msg-{}-{}", chat, date),
                    text,
                    handle.unwrap_or(0),
                    handle.is_none(),
                    date
                ],
            )
            .unwrap();
        let message = self.conn.last_insert_rowid();
        self.conn
            .execute(
                "INSERT INTO chat_message_join (chat_id, message_id, message_date) VALUES (?1, ?2, ?3)",
                params![chat, message, date],
            )
            .unwrap();
        message
    }

    pub fn add_attachment(&self, message: i64, filename: &str, mime: &str) -> i64 {
        self.conn
            .execute(
                "INSERT INTO attachment (filename, mime_type, total_bytes) VALUES (?1, ?2, 2048)",
                params![filename, mime],
            )
            .unwrap();
        let attachment = self.conn.last_insert_rowid();
        self.conn
            .execute(
                "INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (?1, ?2)",
                params![message, attachment],
            )
            .unwrap();
        self.conn
            .execute(
                "UPDATE message SET cache_has_attachments = 1 WHERE ROWID = ?1",
                params![message],
            )
            .unwrap();
        attachment
    }

    pub fn execute(&self, sql: &str) {
        self.conn.execute_batch(sql).unwrap();
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.db_path = self.path.clone();
        config.attachments_dir = self.dir.path().join("Attachments");
        config.query_timeout = Duration::from_secs(2);
        config.poll_interval = Duration::from_millis(50);
        config.pool_size = 2;
        config
    }

    pub fn mirror(&self) -> (Arc<Mirror>, Arc<RecordingBridge>) {
        self.mirror_with(self.config())
    }

    pub fn mirror_with(&self, config: Config) -> (Arc<Mirror>, Arc<RecordingBridge>) {
        let bridge = Arc::new(RecordingBridge::default());
        let mirror = Arc::new(Mirror::new(&config, bridge.clone()));
        (mirror, bridge)
    }
}

/// Bridge double that records instead of sending
#[derive(Default)]
pub struct RecordingBridge {
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingBridge {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl OutboundBridge for RecordingBridge {
    fn send(&self, message: &OutboundMessage) -> chatmirror_core::Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MirrorError::Send("bridge refused".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
