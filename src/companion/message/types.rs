//! 消息远程表的 DTO（请求和响应结构体）

use crate::companion::message::models::{Author, ChatMessage, MessageId};
use crate::companion::serialization::{deserialize_millis, serialize_millis};
use serde::{Deserialize, Serialize};

/// `chat_messages` 表的一行（从 API 响应反序列化）
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub text: String,
    pub is_user: bool,
    #[serde(deserialize_with = "deserialize_millis")]
    pub created_at: i64,
    #[serde(default, deserialize_with = "deserialize_millis")]
    pub updated_at: i64,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<i64>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        ChatMessage {
            id: MessageId::Remote(row.id),
            text: row.text,
            author: if row.is_user { Author::User } else { Author::Ai },
            created_at: row.created_at,
            // 服务器没有返回更新时间时沿用创建时间
            updated_at: if row.updated_at > 0 {
                row.updated_at
            } else {
                row.created_at
            },
            user_id: row.user_id,
            session_id: row.session_id,
        }
    }
}

/// 插入 `chat_messages` 的请求体（不带 id，由服务器生成）
#[derive(Debug, Clone, Serialize)]
pub struct NewMessageRow<'a> {
    pub text: &'a str,
    pub is_user: bool,
    #[serde(serialize_with = "serialize_millis")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_millis")]
    pub updated_at: i64,
    pub user_id: &'a str,
    pub session_id: Option<i64>,
}

impl<'a> From<&'a ChatMessage> for NewMessageRow<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        NewMessageRow {
            text: &msg.text,
            is_user: msg.is_user(),
            created_at: msg.created_at,
            updated_at: msg.updated_at,
            user_id: &msg.user_id,
            session_id: msg.session_id,
        }
    }
}

/// 批量更新会话 ID 的请求体
#[derive(Debug, Serialize)]
pub struct AssignSessionPatch {
    pub session_id: i64,
    #[serde(serialize_with = "serialize_millis")]
    pub updated_at: i64,
}
