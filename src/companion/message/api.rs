//! 消息远程存储
//!
//! 负责 `chat_messages` 表相关的 HTTP 请求（PostgREST 风格接口）

use crate::companion::message::models::ChatMessage;
use crate::companion::message::types::{AssignSessionPatch, MessageRow, NewMessageRow};
use crate::companion::types::{ensure_success, handle_http_response};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// 远程消息存储接口
#[async_trait]
pub trait RemoteMessageStore: Send + Sync {
    /// 查询用户所有未归属会话的消息（按创建时间升序）
    async fn fetch_open_messages(&self, user_id: &str) -> Result<Vec<ChatMessage>>;

    /// 插入一条消息，返回服务器分配的 ID
    async fn insert_message(&self, message: &ChatMessage) -> Result<i64>;

    /// 把一组消息归入指定会话
    async fn assign_session(&self, message_ids: &[i64], session_id: i64, now: i64) -> Result<()>;

    /// 删除一组消息（用户丢弃草稿时）
    async fn delete_messages(&self, message_ids: &[i64]) -> Result<()>;
}

fn id_filter(message_ids: &[i64]) -> String {
    let id_list = message_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({})", id_list)
}

/// 基于 REST 的远程消息存储
pub struct RestMessageStore {
    client: reqwest::Client,
    api_base_url: String,
}

impl RestMessageStore {
    /// 创建新的消息存储客户端
    ///
    /// `client` 应该已经在外部配置好认证头
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/chat_messages", self.api_base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RemoteMessageStore for RestMessageStore {
    async fn fetch_open_messages(&self, user_id: &str) -> Result<Vec<ChatMessage>> {
        let url = self.table_url();
        let user_filter = format!("eq.{}", user_id);
        debug!("[MsgAPI] 查询未归档消息，用户ID: {}", user_id);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("select", "*"),
                ("user_id", user_filter.as_str()),
                ("session_id", "is.null"),
                ("order", "created_at.asc"),
            ])
            .send()
            .await
            .context("查询消息请求失败")?;

        let rows: Vec<MessageRow> = handle_http_response(response, "查询未归档消息").await?;
        info!("[MsgAPI] 📥 获取到 {} 条未归档消息", rows.len());
        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<i64> {
        let url = self.table_url();
        debug!("[MsgAPI] 插入消息: {}", message.id);

        let response = self
            .client
            .post(&url)
            .header("Prefer", "return=representation")
            .json(&NewMessageRow::from(message))
            .send()
            .await
            .context("插入消息请求失败")?;

        let rows: Vec<MessageRow> = handle_http_response(response, "插入消息").await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("插入消息后服务器未返回记录"))?;
        debug!("[MsgAPI] 消息 {} 已持久化，服务器ID: {}", message.id, row.id);
        Ok(row.id)
    }

    async fn assign_session(&self, message_ids: &[i64], session_id: i64, now: i64) -> Result<()> {
        if message_ids.is_empty() {
            warn!("[MsgAPI] 归档会话 {} 时消息列表为空，跳过", session_id);
            return Ok(());
        }
        info!(
            "[MsgAPI] 归档 {} 条消息到会话 {}",
            message_ids.len(),
            session_id
        );

        let response = self
            .client
            .patch(self.table_url())
            .query(&[("id", id_filter(message_ids))])
            .json(&AssignSessionPatch {
                session_id,
                updated_at: now,
            })
            .send()
            .await
            .context("归档消息请求失败")?;

        ensure_success(response, "归档消息").await
    }

    async fn delete_messages(&self, message_ids: &[i64]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        info!("[MsgAPI] 🗑️ 删除 {} 条消息", message_ids.len());

        let response = self
            .client
            .delete(self.table_url())
            .query(&[("id", id_filter(message_ids))])
            .send()
            .await
            .context("删除消息请求失败")?;

        ensure_success(response, "删除消息").await
    }
}
