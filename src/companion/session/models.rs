//! 会话记录模型

use crate::companion::serialization::{deserialize_millis, serialize_millis};
use serde::{Deserialize, Serialize};

/// AI 对一次会话的总结结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 待创建的会话记录（`chat_sessions` 插入请求体）
#[derive(Debug, Clone, Serialize)]
pub struct NewSession {
    pub summary: String,
    pub tags: Vec<String>,
    pub user_id: String,
    #[serde(serialize_with = "serialize_millis")]
    pub created_at: i64,
}

/// 远程会话记录
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub user_id: String,
    #[serde(deserialize_with = "deserialize_millis")]
    pub created_at: i64,
}
