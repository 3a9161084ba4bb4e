//! AI 代理客户端
//!
//! 回复生成和会话总结都是边缘函数（HTTP），这里只负责请求封装

use crate::companion::clock::Clock;
use crate::companion::message::models::ChatMessage;
use crate::companion::serialization::serialize_millis;
use crate::companion::session::api::RemoteSessionStore;
use crate::companion::session::models::{NewSession, SessionSummary};
use crate::companion::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// 回复生成代理
#[async_trait]
pub trait ResponseAgent: Send + Sync {
    /// 输入合并后的用户文本，返回按顺序展示的回复列表
    async fn respond(&self, combined_text: &str, user_id: &str) -> Result<Vec<String>>;
}

/// 会话总结代理
///
/// 调用一次就会创建一条会话记录（非幂等），调用方每次结束流程最多调用一次。
#[async_trait]
pub trait SessionSummarizer: Send + Sync {
    /// 总结消息并创建会话记录，返回新会话 ID
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<i64>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRequest<'a> {
    message: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    #[serde(default)]
    responses: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryMessage<'a> {
    text: &'a str,
    is_user: bool,
    #[serde(serialize_with = "serialize_millis")]
    created_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryRequest<'a> {
    user_id: &'a str,
    messages: Vec<SummaryMessage<'a>>,
}

impl<'a> SummaryRequest<'a> {
    fn new(user_id: &'a str, messages: &'a [ChatMessage]) -> Self {
        Self {
            user_id,
            messages: messages
                .iter()
                .map(|m| SummaryMessage {
                    text: &m.text,
                    is_user: m.is_user(),
                    created_at: m.created_at,
                })
                .collect(),
        }
    }
}

fn function_url(base: &str, name: &str) -> String {
    format!("{}/functions/v1/{}", base.trim_end_matches('/'), name)
}

/// 基于 HTTP 的回复生成代理
pub struct HttpResponseAgent {
    client: reqwest::Client,
    agent_base_url: String,
}

impl HttpResponseAgent {
    pub fn new(client: reqwest::Client, agent_base_url: String) -> Self {
        Self {
            client,
            agent_base_url,
        }
    }
}

#[async_trait]
impl ResponseAgent for HttpResponseAgent {
    async fn respond(&self, combined_text: &str, user_id: &str) -> Result<Vec<String>> {
        let url = function_url(&self.agent_base_url, "companion-reply");
        debug!("[Agent] 请求回复，用户ID: {}, 文本长度: {}", user_id, combined_text.len());

        let response = self
            .client
            .post(&url)
            .json(&ReplyRequest {
                message: combined_text,
                user_id,
            })
            .send()
            .await
            .context("回复生成请求失败")?;

        let reply: ReplyResponse = handle_http_response(response, "回复生成").await?;
        info!("[Agent] 🤖 收到 {} 条回复", reply.responses.len());
        Ok(reply.responses)
    }
}

/// 总结代理：先调用总结函数得到摘要和标签，再写入会话表
pub struct AgentSummarizer {
    client: reqwest::Client,
    agent_base_url: String,
    sessions: Arc<dyn RemoteSessionStore>,
    clock: Arc<dyn Clock>,
}

impl AgentSummarizer {
    pub fn new(
        client: reqwest::Client,
        agent_base_url: String,
        sessions: Arc<dyn RemoteSessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            agent_base_url,
            sessions,
            clock,
        }
    }
}

/// 校验待总结的消息：非空且属于同一用户，返回所属用户 ID
fn batch_owner(messages: &[ChatMessage]) -> Result<&str> {
    let first = messages
        .first()
        .ok_or_else(|| anyhow::anyhow!("没有可总结的消息"))?;
    if let Some(other) = messages.iter().find(|m| m.user_id != first.user_id) {
        return Err(anyhow::anyhow!(
            "待总结消息属于不同用户: {} / {}",
            first.user_id,
            other.user_id
        ));
    }
    Ok(&first.user_id)
}

#[async_trait]
impl SessionSummarizer for AgentSummarizer {
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<i64> {
        let user_id = batch_owner(messages)?;
        let url = function_url(&self.agent_base_url, "summarize-session");
        info!(
            "[Agent] 📝 请求总结会话，用户ID: {}, 消息数: {}",
            user_id,
            messages.len()
        );

        let response = self
            .client
            .post(&url)
            .json(&SummaryRequest::new(user_id, messages))
            .send()
            .await
            .context("会话总结请求失败")?;
        let summary: SessionSummary = handle_http_response(response, "会话总结").await?;
        debug!("[Agent] 总结: {}, 标签: {:?}", summary.summary, summary.tags);

        self.sessions
            .create_session(&NewSession {
                summary: summary.summary,
                tags: summary.tags,
                user_id: user_id.to_string(),
                created_at: self.clock.now_millis(),
            })
            .await
            .context("写入会话记录失败")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::clock::ManualClock;
    use crate::companion::message::models::Author;

    struct NoSessions;

    #[async_trait]
    impl RemoteSessionStore for NoSessions {
        async fn create_session(&self, _session: &NewSession) -> Result<i64> {
            panic!("不应创建会话");
        }
    }

    fn summarizer() -> AgentSummarizer {
        AgentSummarizer::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9".to_string(),
            Arc::new(NoSessions),
            Arc::new(ManualClock::new(0)),
        )
    }

    fn msg(user: &str) -> ChatMessage {
        ChatMessage::new_local("x".into(), Author::User, user.into(), 0)
    }

    #[tokio::test]
    async fn rejects_empty_batch_before_network() {
        assert!(summarizer().summarize(&[]).await.is_err());
    }

    #[tokio::test]
    async fn rejects_mixed_owner_batch() {
        let err = summarizer()
            .summarize(&[msg("u1"), msg("u2")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("u2"));
    }

    #[test]
    fn summary_request_shape() {
        let messages = vec![ChatMessage::new_local(
            "今天跑步了".into(),
            Author::User,
            "u1".into(),
            1_704_067_200_000,
        )];
        let json = serde_json::to_value(SummaryRequest::new("u1", &messages)).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["messages"][0]["isUser"], true);
        assert_eq!(json["messages"][0]["createdAt"], "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn function_url_trims_trailing_slash() {
        assert_eq!(
            function_url("https://x.example/", "summarize-session"),
            "https://x.example/functions/v1/summarize-session"
        );
    }
}
