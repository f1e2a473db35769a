// SQLite 存储实现：会话、消息、文档版本与访问令牌的持久化读写。
use crate::storage::{
    ChatRecord, DocumentVersionRecord, MessageRecord, StorageBackend, UserTokenRecord,
};
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/atelier.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn conn(&self) -> Result<Connection> {
        self.ensure_initialized()?;
        self.open()
    }

    fn parts_to_string(parts: &Value) -> String {
        serde_json::to_string(parts).unwrap_or_else(|_| "[]".to_string())
    }

    fn parts_from_str(text: &str) -> Value {
        serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::Array(Vec::new()))
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                chat_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                visibility TEXT NOT NULL DEFAULT 'private',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at);

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                parts TEXT NOT NULL,
                created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);

            CREATE TABLE IF NOT EXISTS document_versions (
                version_id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_doc ON document_versions(doc_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_documents_chat ON document_versions(chat_id, created_at);

            CREATE TABLE IF NOT EXISTS user_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at REAL NOT NULL,
                expires_at REAL NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn save_chat(&self, record: &ChatRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO chats (chat_id, user_id, title, visibility, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(chat_id) DO UPDATE SET
                 title = excluded.title,
                 visibility = excluded.visibility,
                 updated_at = excluded.updated_at",
            params![
                record.chat_id,
                record.user_id,
                record.title,
                record.visibility,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT chat_id, user_id, title, visibility, created_at, updated_at
                 FROM chats WHERE chat_id = ?1",
                params![chat_id],
                |row| {
                    Ok(ChatRecord {
                        chat_id: row.get(0)?,
                        user_id: row.get(1)?,
                        title: row.get(2)?,
                        visibility: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn list_chats(&self, user_id: &str, limit: i64) -> Result<Vec<ChatRecord>> {
        let conn = self.conn()?;
        let limit = if limit <= 0 { i64::MAX } else { limit };
        let mut stmt = conn.prepare(
            "SELECT chat_id, user_id, title, visibility, created_at, updated_at
             FROM chats WHERE user_id = ?1 ORDER BY updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit], |row| {
            Ok(ChatRecord {
                chat_id: row.get(0)?,
                user_id: row.get(1)?,
                title: row.get(2)?,
                visibility: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn update_chat_title(&self, chat_id: &str, title: &str, updated_at: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE chats SET title = ?2, updated_at = ?3 WHERE chat_id = ?1",
            params![chat_id, title, updated_at],
        )?;
        Ok(())
    }

    fn update_chat_visibility(
        &self,
        chat_id: &str,
        visibility: &str,
        updated_at: f64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE chats SET visibility = ?2, updated_at = ?3 WHERE chat_id = ?1",
            params![chat_id, visibility, updated_at],
        )?;
        Ok(())
    }

    fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id])?;
        conn.execute(
            "DELETE FROM document_versions WHERE chat_id = ?1",
            params![chat_id],
        )?;
        conn.execute("DELETE FROM chats WHERE chat_id = ?1", params![chat_id])?;
        Ok(())
    }

    fn save_messages(&self, records: &[MessageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO messages (message_id, chat_id, role, parts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(message_id) DO UPDATE SET parts = excluded.parts",
                params![
                    record.message_id,
                    record.chat_id,
                    record.role,
                    Self::parts_to_string(&record.parts),
                    record.created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_message_by_id(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT message_id, chat_id, role, parts, created_at
                 FROM messages WHERE message_id = ?1",
                params![message_id],
                |row| {
                    let parts: String = row.get(3)?;
                    Ok(MessageRecord {
                        message_id: row.get(0)?,
                        chat_id: row.get(1)?,
                        role: row.get(2)?,
                        parts: Self::parts_from_str(&parts),
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn load_chat_messages(&self, chat_id: &str, limit: i64) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let limit = if limit <= 0 { i64::MAX } else { limit };
        // 取最近 limit 条后按时间正序返回，rowid 兜底同毫秒写入的次序。
        let mut stmt = conn.prepare(
            "SELECT message_id, chat_id, role, parts, created_at FROM (
                 SELECT rowid AS seq, message_id, chat_id, role, parts, created_at
                 FROM messages WHERE chat_id = ?1
                 ORDER BY created_at DESC, seq DESC LIMIT ?2
             ) ORDER BY created_at ASC, seq ASC",
        )?;
        let rows = stmt.query_map(params![chat_id, limit], |row| {
            let parts: String = row.get(3)?;
            Ok(MessageRecord {
                message_id: row.get(0)?,
                chat_id: row.get(1)?,
                role: row.get(2)?,
                parts: Self::parts_from_str(&parts),
                created_at: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn delete_messages_after_timestamp(&self, chat_id: &str, timestamp: f64) -> Result<i64> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE chat_id = ?1 AND created_at > ?2",
            params![chat_id, timestamp],
        )?;
        Ok(deleted as i64)
    }

    fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE chat_id = ?1 AND message_id = ?2",
            params![chat_id, message_id],
        )?;
        Ok(deleted as i64)
    }

    fn save_document_version(&self, record: &DocumentVersionRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO document_versions
                 (doc_id, chat_id, user_id, kind, title, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.doc_id,
                record.chat_id,
                record.user_id,
                record.kind,
                record.title,
                record.content,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    fn load_document_versions(
        &self,
        chat_id: &str,
        limit: i64,
    ) -> Result<Vec<DocumentVersionRecord>> {
        let conn = self.conn()?;
        let limit = if limit <= 0 { i64::MAX } else { limit };
        let mut stmt = conn.prepare(
            "SELECT doc_id, chat_id, user_id, kind, title, content, created_at
             FROM document_versions WHERE chat_id = ?1
             ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id, limit], |row| {
            Ok(DocumentVersionRecord {
                doc_id: row.get(0)?,
                chat_id: row.get(1)?,
                user_id: row.get(2)?,
                kind: row.get(3)?,
                title: row.get(4)?,
                content: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn get_latest_document(&self, doc_id: &str) -> Result<Option<DocumentVersionRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT doc_id, chat_id, user_id, kind, title, content, created_at
                 FROM document_versions WHERE doc_id = ?1
                 ORDER BY created_at DESC, version_id DESC LIMIT 1",
                params![doc_id],
                |row| {
                    Ok(DocumentVersionRecord {
                        doc_id: row.get(0)?,
                        chat_id: row.get(1)?,
                        user_id: row.get(2)?,
                        kind: row.get(3)?,
                        title: row.get(4)?,
                        content: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT token, user_id, created_at, expires_at
                 FROM user_tokens WHERE token = ?1",
                params![token],
                |row| {
                    Ok(UserTokenRecord {
                        token: row.get(0)?,
                        user_id: row.get(1)?,
                        created_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_user_token(&self, record: &UserTokenRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_tokens (token, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(token) DO UPDATE SET
                 user_id = excluded.user_id,
                 expires_at = excluded.expires_at",
            params![
                record.token,
                record.user_id,
                record.created_at,
                record.expires_at,
            ],
        )?;
        Ok(())
    }
}
