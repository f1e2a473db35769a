// 存储模块：封装 SQLite 持久化读写，提供会话/消息/文档版本统一接口。

mod sqlite;

use crate::config::StorageConfig;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

pub use sqlite::SqliteStorage;

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub chat_id: String,
    pub user_id: String,
    pub title: String,
    pub visibility: String,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub chat_id: String,
    pub role: String,
    /// 结构化分段：文本、工具调用记录与工件引用，JSON 数组。
    pub parts: Value,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct DocumentVersionRecord {
    pub doc_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub content: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct UserTokenRecord {
    pub token: String,
    pub user_id: String,
    pub created_at: f64,
    pub expires_at: f64,
}

/// 持久化后端接口。每个调用视为原子操作，调用方不做跨调用事务；
/// 消息保存与文档版本保存之间的失败按错误上抛，不做静默重试。
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn save_chat(&self, record: &ChatRecord) -> Result<()>;
    fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRecord>>;
    fn list_chats(&self, user_id: &str, limit: i64) -> Result<Vec<ChatRecord>>;
    fn update_chat_title(&self, chat_id: &str, title: &str, updated_at: f64) -> Result<()>;
    fn update_chat_visibility(&self, chat_id: &str, visibility: &str, updated_at: f64)
        -> Result<()>;
    fn delete_chat(&self, chat_id: &str) -> Result<()>;

    fn save_messages(&self, records: &[MessageRecord]) -> Result<()>;
    fn get_message_by_id(&self, message_id: &str) -> Result<Option<MessageRecord>>;
    fn load_chat_messages(&self, chat_id: &str, limit: i64) -> Result<Vec<MessageRecord>>;
    fn delete_messages_after_timestamp(&self, chat_id: &str, timestamp: f64) -> Result<i64>;
    fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<i64>;

    fn save_document_version(&self, record: &DocumentVersionRecord) -> Result<()>;
    fn load_document_versions(&self, chat_id: &str, limit: i64)
        -> Result<Vec<DocumentVersionRecord>>;
    fn get_latest_document(&self, doc_id: &str) -> Result<Option<DocumentVersionRecord>>;

    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>>;
    fn upsert_user_token(&self, record: &UserTokenRecord) -> Result<()>;
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let storage = Arc::new(SqliteStorage::new(config.db_path.clone()));
    storage.ensure_initialized()?;
    Ok(storage)
}
