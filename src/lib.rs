pub mod companion;

// 重新导出常用类型，方便外部使用
pub use companion::{
    agent::{AgentSummarizer, HttpResponseAgent, ResponseAgent, SessionSummarizer},
    client::{ClientConfig, CompanionClient, CompanionDeps, SyncReport},
    clock::{Clock, ManualClock, SystemClock},
    draft::{draft_key, DraftStore, MemoryDraftStore, SqliteDraftStore},
    error::CompanionError,
    listener::{CompanionListener, EmptyCompanionListener},
    message::{Author, ChatMessage, MessageId, RemoteMessageStore, RestMessageStore},
    session::{RemoteSessionStore, RestSessionStore, SessionPhase},
};
