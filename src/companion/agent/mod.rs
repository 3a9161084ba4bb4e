//! AI 代理模块
//!
//! 回复生成与会话总结两个外部协作方

pub mod api;

pub use api::{AgentSummarizer, HttpResponseAgent, ResponseAgent, SessionSummarizer};
