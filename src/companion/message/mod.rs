//! 消息模块
//!
//! 聊天消息模型以及远程消息表的访问层

pub mod api;
pub mod models;
pub mod types;

// 重新导出主要类型
pub use api::{RemoteMessageStore, RestMessageStore};
pub use models::{Author, ChatMessage, MessageId};
pub use types::MessageRow;
