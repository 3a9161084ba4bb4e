//! 本地草稿数据访问层（DAO）
//!
//! 保存尚未总结的当前会话消息，应用重启后可以恢复。按用户派生的 key 存储，
//! 每个 key 对应一份 JSON 序列化的消息列表。

use crate::companion::message::models::ChatMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// 根据用户 ID 派生草稿 key（去掉非法字符）
pub fn draft_key(user_id: &str) -> String {
    let sanitized: String = user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("questlog_chat_draft_{}", sanitized)
}

/// 本地草稿存储接口
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// 读取草稿，不存在时返回空列表
    async fn load(&self, key: &str) -> Result<Vec<ChatMessage>>;

    /// 覆盖写入草稿
    async fn save(&self, key: &str, messages: &[ChatMessage]) -> Result<()>;

    /// 删除草稿
    async fn remove(&self, key: &str) -> Result<()>;
}

/// 基于 SQLite 的草稿存储
pub struct SqliteDraftStore {
    pool: Pool<Sqlite>,
}

impl SqliteDraftStore {
    /// 连接数据库并初始化表结构
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context(format!("连接SQLite数据库失败: {}", db_url))?;
        let store = Self::new(pool);
        store.init_db().await?;
        Ok(store)
    }

    /// 使用共享连接池创建
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// 初始化数据库表结构
    pub async fn init_db(&self) -> Result<()> {
        info!("[DraftDAO/DB] 初始化草稿表结构");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_chat_drafts (
                draft_key TEXT PRIMARY KEY,
                payload TEXT NOT NULL DEFAULT '[]',
                update_time INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("创建草稿表失败")?;
        Ok(())
    }
}

#[async_trait]
impl DraftStore for SqliteDraftStore {
    async fn load(&self, key: &str) -> Result<Vec<ChatMessage>> {
        let row = sqlx::query("SELECT payload FROM local_chat_drafts WHERE draft_key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("查询草稿失败")?;

        let Some(row) = row else {
            debug!("[DraftDAO] 草稿不存在: {}", key);
            return Ok(Vec::new());
        };
        let payload: String = row.get("payload");
        let messages: Vec<ChatMessage> =
            serde_json::from_str(&payload).context(format!("解析草稿失败: {}", key))?;
        debug!("[DraftDAO] 读取草稿 {}，共 {} 条消息", key, messages.len());
        Ok(messages)
    }

    async fn save(&self, key: &str, messages: &[ChatMessage]) -> Result<()> {
        let payload = serde_json::to_string(messages).context("序列化草稿失败")?;
        sqlx::query(
            r#"
            INSERT INTO local_chat_drafts (draft_key, payload, update_time)
            VALUES (?, ?, ?)
            ON CONFLICT(draft_key) DO UPDATE SET
                payload = excluded.payload,
                update_time = excluded.update_time
            "#,
        )
        .bind(key)
        .bind(payload)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("写入草稿失败")?;
        debug!("[DraftDAO] 写入草稿 {}，共 {} 条消息", key, messages.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_chat_drafts WHERE draft_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("删除草稿失败")?;
        debug!("[DraftDAO] 删除草稿 {}", key);
        Ok(())
    }
}

/// 内存草稿存储（测试或临时会话使用）
#[derive(Default)]
pub struct MemoryDraftStore {
    entries: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<ChatMessage>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("草稿存储锁已损坏"))
    }
}

#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn load(&self, key: &str) -> Result<Vec<ChatMessage>> {
        Ok(self.entries()?.get(key).cloned().unwrap_or_default())
    }

    async fn save(&self, key: &str, messages: &[ChatMessage]) -> Result<()> {
        self.entries()?.insert(key.to_string(), messages.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::message::models::{Author, MessageId};

    async fn memory_sqlite() -> SqliteDraftStore {
        // 内存库每个连接相互独立，只能用单连接
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteDraftStore::new(pool);
        store.init_db().await.unwrap();
        store
    }

    fn msg(text: &str, user: &str, at: i64) -> ChatMessage {
        ChatMessage::new_local(text.to_string(), Author::User, user.to_string(), at)
    }

    #[test]
    fn draft_key_is_deterministic_and_sanitized() {
        assert_eq!(draft_key("u1"), draft_key("u1"));
        assert_ne!(draft_key("u1"), draft_key("u2"));
        assert_eq!(draft_key("a@b.c"), "questlog_chat_draft_a_b_c");
    }

    #[tokio::test]
    async fn sqlite_store_round_trip_keeps_order() {
        let store = memory_sqlite().await;
        let key = draft_key("u1");
        assert!(store.load(&key).await.unwrap().is_empty());

        let mut second = msg("second", "u1", 2);
        second.id = MessageId::Remote(99);
        let messages = vec![msg("first", "u1", 1), second];
        store.save(&key, &messages).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), messages);

        store.save(&key, &messages[..1]).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap().len(), 1);

        store.remove(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_are_disjoint() {
        let store = MemoryDraftStore::new();
        store.save(&draft_key("u1"), &[msg("a", "u1", 1)]).await.unwrap();
        assert!(store.load(&draft_key("u2")).await.unwrap().is_empty());
    }
}
