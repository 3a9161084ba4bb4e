//! 本地草稿模块
//!
//! 应用重启后恢复当前未总结的会话

pub mod dao;
pub mod writer;

// 重新导出主要类型
pub use dao::{draft_key, DraftStore, MemoryDraftStore, SqliteDraftStore};
pub use writer::DraftWriter;
