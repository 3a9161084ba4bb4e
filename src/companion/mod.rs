//! QuestLog 陪伴聊天核心模块
//!
//! 负责聊天会话生命周期（不活跃自动结束、AI 总结）以及消息的乐观同步

pub mod agent;
pub mod client;
pub mod clock;
pub mod draft;
pub mod error;
pub mod listener;
pub mod message;
pub mod serialization;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出会话相关类型
pub use client::{ClientConfig, CompanionClient, CompanionDeps, SyncReport};
pub use session::{SessionPhase, SessionTimer};
