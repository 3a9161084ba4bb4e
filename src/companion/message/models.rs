//! 聊天消息本地模型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 消息 ID
///
/// `Local` 是客户端生成的占位 ID（尚未被远程存储确认），`Remote` 是服务器分配的 ID。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum MessageId {
    Local(Uuid),
    Remote(i64),
}

impl MessageId {
    /// 生成新的客户端 ID
    pub fn new_local() -> Self {
        MessageId::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }

    /// 服务器 ID（未持久化时为 None）
    pub fn remote_id(&self) -> Option<i64> {
        match self {
            MessageId::Remote(id) => Some(*id),
            MessageId::Local(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Local(token) => write!(f, "local:{}", token),
            MessageId::Remote(id) => write!(f, "remote:{}", id),
        }
    }
}

/// 消息作者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Author {
    User,
    Ai,
}

/// 聊天消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: String,
    pub author: Author,
    /// 创建时间（毫秒）
    pub created_at: i64,
    /// 最后更新时间（毫秒）
    pub updated_at: i64,
    /// 所属用户 ID
    pub user_id: String,
    /// 所属会话 ID，None 表示仍在当前未结束的会话中
    #[serde(default)]
    pub session_id: Option<i64>,
}

impl ChatMessage {
    /// 构造一条尚未持久化的消息
    pub fn new_local(text: String, author: Author, user_id: String, now: i64) -> Self {
        Self {
            id: MessageId::new_local(),
            text,
            author,
            created_at: now,
            updated_at: now,
            user_id,
            session_id: None,
        }
    }

    pub fn is_user(&self) -> bool {
        self.author == Author::User
    }

    /// 是否属于当前未结束的会话
    pub fn is_open(&self) -> bool {
        self.session_id.is_none()
    }
}
