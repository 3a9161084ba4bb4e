//! 陪伴聊天监听器回调接口
//!
//! UI 层通过注册监听器获取状态变化，回调都在客户端内部锁释放之后触发。

use crate::companion::message::models::ChatMessage;
use async_trait::async_trait;

/// 陪伴聊天监听器
#[async_trait]
pub trait CompanionListener: Send + Sync {
    /// 新消息已追加到界面（用户消息或 AI 回复）
    async fn on_message_appended(&self, message: ChatMessage);

    /// 已有消息被原地更新（服务器 ID 回填、归入会话）
    async fn on_message_updated(&self, message: ChatMessage);

    /// "正在输入" 状态变化
    async fn on_typing_changed(&self, typing: bool);

    /// 会话已结束；`session_id` 为 None 表示没有生成会话记录
    async fn on_session_ended(&self, session_id: Option<i64>);

    /// 会话总结（checkup）已创建
    async fn on_checkup_created(&self, session_id: i64);

    /// 错误槽位被写入
    async fn on_error(&self, message: String);
}

/// 空实现（默认监听器）
pub struct EmptyCompanionListener;

#[async_trait]
impl CompanionListener for EmptyCompanionListener {
    async fn on_message_appended(&self, _message: ChatMessage) {}
    async fn on_message_updated(&self, _message: ChatMessage) {}
    async fn on_typing_changed(&self, _typing: bool) {}
    async fn on_session_ended(&self, _session_id: Option<i64>) {}
    async fn on_checkup_created(&self, _session_id: i64) {}
    async fn on_error(&self, _message: String) {}
}
