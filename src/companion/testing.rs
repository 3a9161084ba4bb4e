//! 测试用的内存假实现和客户端组装

use crate::companion::agent::{ResponseAgent, SessionSummarizer};
use crate::companion::client::{ClientConfig, CompanionClient, CompanionDeps};
use crate::companion::clock::ManualClock;
use crate::companion::draft::MemoryDraftStore;
use crate::companion::listener::CompanionListener;
use crate::companion::message::{ChatMessage, MessageId, RemoteMessageStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::Notify;

static INIT_LOGGER: Once = Once::new();

/// 测试日志（只初始化一次，输出交给测试框架捕获）
pub(crate) fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// 挂起假实现的调用，用来构造调用进行中的场景
pub(crate) struct CallGate {
    called: Notify,
    released: Notify,
}

impl CallGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            called: Notify::new(),
            released: Notify::new(),
        })
    }

    /// 调用方进入假实现后返回
    pub async fn wait_called(&self) {
        self.called.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    async fn pass(gate: &Mutex<Option<Arc<CallGate>>>) {
        let gate = gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.called.notify_one();
            gate.released.notified().await;
        }
    }
}

/// 内存版远程消息表
pub(crate) struct FakeMessageStore {
    rows: Mutex<Vec<ChatMessage>>,
    next_id: AtomicI64,
    assign_calls: Mutex<Vec<(Vec<i64>, i64)>>,
    insert_gate: Mutex<Option<Arc<CallGate>>>,
    pub fail_inserts: AtomicBool,
    pub fail_assign: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl FakeMessageStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            assign_calls: Mutex::new(Vec::new()),
            insert_gate: Mutex::new(None),
            fail_inserts: AtomicBool::new(false),
            fail_assign: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }
    }

    /// 下一次插入会挂起，直到 `release`
    pub fn hold_insert(&self) -> Arc<CallGate> {
        let gate = CallGate::new();
        *self.insert_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// 直接写入一行（模拟其他设备写入的数据），返回服务器 ID
    pub fn seed(&self, mut message: ChatMessage) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        message.id = MessageId::Remote(id);
        self.rows.lock().unwrap().push(message);
        id
    }

    pub fn rows(&self) -> Vec<ChatMessage> {
        self.rows.lock().unwrap().clone()
    }

    pub fn open_rows(&self, user_id: &str) -> Vec<ChatMessage> {
        self.rows()
            .into_iter()
            .filter(|m| m.user_id == user_id && m.is_open())
            .collect()
    }

    pub fn assign_calls(&self) -> Vec<(Vec<i64>, i64)> {
        self.assign_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteMessageStore for FakeMessageStore {
    async fn fetch_open_messages(&self, user_id: &str) -> Result<Vec<ChatMessage>> {
        let mut rows = self.open_rows(user_id);
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<i64> {
        CallGate::pass(&self.insert_gate).await;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(anyhow!("插入消息失败: 网络不可用"));
        }
        Ok(self.seed(message.clone()))
    }

    async fn assign_session(&self, message_ids: &[i64], session_id: i64, now: i64) -> Result<()> {
        self.assign_calls
            .lock()
            .unwrap()
            .push((message_ids.to_vec(), session_id));
        if self.fail_assign.load(Ordering::SeqCst) {
            return Err(anyhow!("归档消息失败: 网络不可用"));
        }
        for row in self.rows.lock().unwrap().iter_mut() {
            if row.id.remote_id().is_some_and(|id| message_ids.contains(&id)) {
                row.session_id = Some(session_id);
                row.updated_at = now;
            }
        }
        Ok(())
    }

    async fn delete_messages(&self, message_ids: &[i64]) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(anyhow!("删除消息失败: 网络不可用"));
        }
        self.rows
            .lock()
            .unwrap()
            .retain(|row| !row.id.remote_id().is_some_and(|id| message_ids.contains(&id)));
        Ok(())
    }
}

/// 回复代理假实现
pub(crate) struct FakeResponder {
    calls: Mutex<Vec<String>>,
    replies: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<CallGate>>>,
    pub fail: AtomicBool,
}

impl FakeResponder {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_replies(&self, replies: &[&str]) {
        *self.replies.lock().unwrap() = replies.iter().map(|s| s.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// 下一次调用会挂起，直到 `release`
    pub fn hold(&self) -> Arc<CallGate> {
        let gate = CallGate::new();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ResponseAgent for FakeResponder {
    async fn respond(&self, combined_text: &str, _user_id: &str) -> Result<Vec<String>> {
        self.calls.lock().unwrap().push(combined_text.to_string());
        CallGate::pass(&self.gate).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("回复生成失败: 500"));
        }
        Ok(self.replies.lock().unwrap().clone())
    }
}

/// 总结代理假实现，会话 ID 从 100 开始递增
pub(crate) struct FakeSummarizer {
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    next_id: AtomicI64,
    gate: Mutex<Option<Arc<CallGate>>>,
    pub fail: AtomicBool,
}

impl FakeSummarizer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
            gate: Mutex::new(None),
            fail: AtomicBool::new(false),
        }
    }

    /// 下一次调用会挂起，直到 `release`
    pub fn hold(&self) -> Arc<CallGate> {
        let gate = CallGate::new();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionSummarizer for FakeSummarizer {
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<i64> {
        self.calls.lock().unwrap().push(messages.to_vec());
        CallGate::pass(&self.gate).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("会话总结失败: 超时"));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// 记录监听器回调
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl CompanionListener for RecordingListener {
    async fn on_message_appended(&self, message: ChatMessage) {
        self.push(format!("appended:{}", message.text));
    }

    async fn on_message_updated(&self, message: ChatMessage) {
        self.push(format!("updated:{}", message.id));
    }

    async fn on_typing_changed(&self, typing: bool) {
        self.push(format!("typing:{}", typing));
    }

    async fn on_session_ended(&self, session_id: Option<i64>) {
        self.push(format!("ended:{:?}", session_id));
    }

    async fn on_checkup_created(&self, session_id: i64) {
        self.push(format!("checkup:{}", session_id));
    }

    async fn on_error(&self, message: String) {
        self.push(format!("error:{}", message));
    }
}

/// 用假实现组装好的客户端
pub(crate) struct Harness {
    pub client: CompanionClient,
    pub clock: Arc<ManualClock>,
    pub store: Arc<FakeMessageStore>,
    pub responder: Arc<FakeResponder>,
    pub summarizer: Arc<FakeSummarizer>,
    pub drafts: Arc<MemoryDraftStore>,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_drafts(Arc::new(MemoryDraftStore::new()))
    }

    pub fn with_drafts(drafts: Arc<MemoryDraftStore>) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(FakeMessageStore::new());
        let responder = Arc::new(FakeResponder::new());
        let summarizer = Arc::new(FakeSummarizer::new());
        let listener = Arc::new(RecordingListener::default());
        let deps = CompanionDeps {
            messages: store.clone(),
            responder: responder.clone(),
            summarizer: summarizer.clone(),
            drafts: drafts.clone(),
            clock: clock.clone(),
        };
        let client = CompanionClient::with_listener(Self::config(), deps, listener.clone());
        Self {
            client,
            clock,
            store,
            responder,
            summarizer,
            drafts,
            listener,
        }
    }

    pub fn config() -> ClientConfig {
        ClientConfig::new("http://localhost:54321".to_string(), "anon-key".to_string())
    }

    pub fn advance(&self, millis: u64) {
        self.clock.advance(Duration::from_millis(millis));
    }
}
