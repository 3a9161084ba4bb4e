//! 会话模块
//!
//! 会话记录、不活跃计时状态机以及远程会话表的访问层

pub mod api;
pub mod models;
pub mod timer;

// 重新导出主要类型
pub use api::{RemoteSessionStore, RestSessionStore};
pub use models::{NewSession, SessionRecord, SessionSummary};
pub use timer::{SessionPhase, SessionTimer};
