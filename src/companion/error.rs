//! 陪伴聊天错误类型

use thiserror::Error;

/// 管道对外暴露的错误
///
/// 所有错误都在本地恢复，同时写入客户端唯一的错误槽位，UI 可据此展示横幅或行内提示。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompanionError {
    /// 需要登录的操作在没有用户身份时被调用
    #[error("未登录，无法{operation}")]
    Unauthenticated { operation: &'static str },

    /// 消息内容为空（去掉首尾空白后）
    #[error("消息内容不能为空")]
    EmptyMessage,

    /// 结束会话时发现不属于当前用户的消息
    #[error("消息归属校验失败：消息 {message_id} 属于用户 {owner}，当前用户 {expected}")]
    OwnershipViolation {
        message_id: String,
        owner: String,
        expected: String,
    },

    /// 已有一次会话结束流程正在进行
    #[error("会话正在结束中，请稍候")]
    SessionBusy,

    /// 远程存储或 AI 调用失败
    #[error("远程调用失败：{0}")]
    Remote(String),
}

impl CompanionError {
    pub(crate) fn remote(err: &anyhow::Error) -> Self {
        CompanionError::Remote(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, CompanionError>;
