//! 会话远程存储
//!
//! `chat_sessions` 表只需要插入操作

use crate::companion::session::models::{NewSession, SessionRecord};
use crate::companion::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

/// 远程会话存储接口
#[async_trait]
pub trait RemoteSessionStore: Send + Sync {
    /// 创建会话记录，返回服务器生成的会话 ID
    async fn create_session(&self, session: &NewSession) -> Result<i64>;
}

/// 基于 REST 的会话存储
pub struct RestSessionStore {
    client: reqwest::Client,
    api_base_url: String,
}

impl RestSessionStore {
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }
}

#[async_trait]
impl RemoteSessionStore for RestSessionStore {
    async fn create_session(&self, session: &NewSession) -> Result<i64> {
        let url = format!(
            "{}/rest/v1/chat_sessions",
            self.api_base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Prefer", "return=representation")
            .json(session)
            .send()
            .await
            .context("创建会话请求失败")?;

        let records: Vec<SessionRecord> = handle_http_response(response, "创建会话").await?;
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("创建会话后服务器未返回记录"))?;
        info!(
            "[SessionAPI] ✅ 会话已创建，ID: {}, 标签: {:?}",
            record.id, record.tags
        );
        Ok(record.id)
    }
}
