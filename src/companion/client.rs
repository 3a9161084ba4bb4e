//! 陪伴聊天客户端核心实现模块
//!
//! 包含乐观消息管道、会话计时驱动、草稿写透以及与远程存储的同步。
//! 客户端在应用启动时创建一次，通过 `Clone`（内部共享 `Arc`）传给各个 UI 消费者。
//!
//! 所有定时行为（回复防抖、逐条展示、不活跃超时）只记录截止时间，由 `tick` 推进；
//! `start` 会启动一个按 `tick_interval` 调用 `tick` 的驱动循环。

use crate::companion::agent::{AgentSummarizer, HttpResponseAgent, ResponseAgent, SessionSummarizer};
use crate::companion::clock::{Clock, SystemClock};
use crate::companion::draft::{draft_key, DraftStore, DraftWriter, SqliteDraftStore};
use crate::companion::error::{CompanionError, Result};
use crate::companion::listener::{CompanionListener, EmptyCompanionListener};
use crate::companion::message::{
    Author, ChatMessage, MessageId, RemoteMessageStore, RestMessageStore,
};
use crate::companion::session::{RestSessionStore, SessionPhase, SessionTimer};
use crate::companion::types::build_authed_client;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 数据库 REST 接口基础地址
    pub api_base_url: String,
    /// 项目 apikey
    pub api_key: String,
    /// 登录后的访问令牌（未登录时与 apikey 相同）
    pub access_token: String,
    /// AI 边缘函数基础地址
    pub agent_base_url: String,
    /// 本地草稿 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://questlog_drafts.db?mode=rwc`
    pub draft_db_url: String,
    /// AI 回复防抖延迟
    pub response_delay: Duration,
    /// AI 回复逐条展示的间隔
    pub stagger_delay: Duration,
    /// 不活跃自动结束会话的时长
    pub inactivity_window: Duration,
    /// 后台同步间隔
    pub sync_interval: Duration,
    /// 驱动循环 tick 间隔
    pub tick_interval: Duration,
    /// AI 回复失败时展示的兜底回复
    pub fallback_reply: String,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(api_base_url: String, api_key: String) -> Self {
        Self {
            agent_base_url: api_base_url.clone(),
            access_token: api_key.clone(),
            api_base_url,
            api_key,
            draft_db_url: "sqlite://questlog_drafts.db?mode=rwc".to_string(),
            response_delay: Duration::from_millis(1500),
            stagger_delay: Duration::from_millis(1200),
            inactivity_window: Duration::from_secs(5 * 60),
            sync_interval: Duration::from_secs(30),
            tick_interval: Duration::from_millis(250),
            fallback_reply: "抱歉，连接好像出了点问题，请稍后再试。".to_string(),
        }
    }
}

/// 客户端依赖（构造时注入）
#[derive(Clone)]
pub struct CompanionDeps {
    pub messages: Arc<dyn RemoteMessageStore>,
    pub responder: Arc<dyn ResponseAgent>,
    pub summarizer: Arc<dyn SessionSummarizer>,
    pub drafts: Arc<dyn DraftStore>,
    pub clock: Arc<dyn Clock>,
}

impl CompanionDeps {
    /// 按配置创建 HTTP 实现和 SQLite 草稿存储
    pub async fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let http_client = build_authed_client(&config.api_key, &config.access_token)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sessions = Arc::new(RestSessionStore::new(
            http_client.clone(),
            config.api_base_url.clone(),
        ));
        let drafts = SqliteDraftStore::connect(&config.draft_db_url).await?;

        Ok(Self {
            messages: Arc::new(RestMessageStore::new(
                http_client.clone(),
                config.api_base_url.clone(),
            )),
            responder: Arc::new(HttpResponseAgent::new(
                http_client.clone(),
                config.agent_base_url.clone(),
            )),
            summarizer: Arc::new(AgentSummarizer::new(
                http_client,
                config.agent_base_url.clone(),
                sessions,
                clock.clone(),
            )),
            drafts: Arc::new(drafts),
            clock,
        })
    }
}

/// 一次同步的结果统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// 成功写入远程的消息数
    pub inserted: usize,
    /// 写入失败（保留本地 ID 等待重试）的消息数
    pub failed: usize,
    /// 成功归入会话的消息数
    pub assigned: usize,
    /// 成功删除的远程消息数
    pub deleted: usize,
}

/// 锁内收集、锁外派发的监听器事件
enum Event {
    Appended(ChatMessage),
    Updated(ChatMessage),
    Typing(bool),
    SessionEnded(Option<i64>),
    CheckupCreated(i64),
    Error(String),
}

/// 待展示的 AI 回复
struct PendingReveal {
    text: String,
    due_at: i64,
}

/// 待重试的会话归档
struct SessionAssignment {
    session_id: i64,
    message_ids: Vec<i64>,
}

/// 管道内存状态（唯一写入方是客户端自身）
struct PipelineState {
    user_id: Option<String>,
    /// 每次切换用户加一，异步调用返回时据此丢弃上一个用户的结果
    generation: u64,
    messages: Vec<ChatMessage>,
    /// 上次 AI 回复之后累计的用户输入
    pending_batch: Vec<String>,
    response_due_at: Option<i64>,
    responses_in_flight: usize,
    reveal_queue: VecDeque<PendingReveal>,
    typing: bool,
    timer: SessionTimer,
    session_ended: bool,
    checkup_created: bool,
    last_error: Option<CompanionError>,
    /// 正在写入远程的本地 ID
    syncing: HashSet<Uuid>,
    /// 会话结束期间被替换成服务器 ID 的本地 ID
    reconciled: HashMap<Uuid, i64>,
    assignment_outbox: Vec<SessionAssignment>,
    /// 用户丢弃的已持久化消息，远程刷新时跳过
    discarded: HashSet<i64>,
    /// 待重试的远程删除
    delete_outbox: Vec<i64>,
}

impl PipelineState {
    fn new(inactivity_window: Duration) -> Self {
        Self {
            user_id: None,
            generation: 0,
            messages: Vec::new(),
            pending_batch: Vec::new(),
            response_due_at: None,
            responses_in_flight: 0,
            reveal_queue: VecDeque::new(),
            typing: false,
            timer: SessionTimer::new(inactivity_window),
            session_ended: false,
            checkup_created: false,
            last_error: None,
            syncing: HashSet::new(),
            reconciled: HashMap::new(),
            assignment_outbox: Vec::new(),
            discarded: HashSet::new(),
            delete_outbox: Vec::new(),
        }
    }

    fn open_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().filter(|m| m.is_open()).cloned().collect()
    }

    /// 草稿内容：打开的消息，加上已归档但还没写入远程的消息
    fn draft_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter(|m| m.is_open() || m.id.is_local())
            .cloned()
            .collect()
    }

    /// 写入错误槽位
    fn fail(&mut self, err: CompanionError, events: &mut Vec<Event>) -> CompanionError {
        warn!("[Pipeline] ❌ {}", err);
        self.last_error = Some(err.clone());
        events.push(Event::Error(err.to_string()));
        err
    }

    fn set_typing(&mut self, typing: bool, events: &mut Vec<Event>) {
        if self.typing != typing {
            self.typing = typing;
            events.push(Event::Typing(typing));
        }
    }

    /// 没有待展示回复、也没有进行中的 AI 调用时清除输入状态
    fn settle_typing(&mut self, events: &mut Vec<Event>) {
        if self.reveal_queue.is_empty() && self.responses_in_flight == 0 {
            self.set_typing(false, events);
        }
    }

    /// 展示所有已到期的 AI 回复，返回是否有新消息
    fn reveal_due(&mut self, now: i64, events: &mut Vec<Event>) -> bool {
        let Some(user) = self.user_id.clone() else {
            return false;
        };
        let mut changed = false;
        while self.reveal_queue.front().is_some_and(|r| r.due_at <= now) {
            if let Some(reveal) = self.reveal_queue.pop_front() {
                let msg = ChatMessage::new_local(reveal.text, Author::Ai, user.clone(), now);
                self.messages.push(msg.clone());
                events.push(Event::Appended(msg));
                changed = true;
            }
        }
        self.settle_typing(events);
        changed
    }

    /// 切换用户：清空所有内存状态
    ///
    /// 按服务器 ID 记录的重试队列、丢弃列表和 ID 映射与用户无关，保留。
    fn clear_for_identity(&mut self, user_id: Option<String>, events: &mut Vec<Event>) {
        self.messages.clear();
        self.pending_batch.clear();
        self.response_due_at = None;
        self.responses_in_flight = 0;
        self.reveal_queue.clear();
        self.set_typing(false, events);
        self.timer.reset();
        self.session_ended = false;
        self.checkup_created = false;
        self.last_error = None;
        self.syncing.clear();
        self.generation += 1;
        self.user_id = user_id;
    }

    /// 用服务器 ID 替换本地 ID
    ///
    /// 写入期间消息已经归入会话时，返回需要补做的归档。
    fn reconcile(
        &mut self,
        token: Uuid,
        server_id: i64,
        sent: &ChatMessage,
        events: &mut Vec<Event>,
    ) -> Option<SessionAssignment> {
        let local_id = MessageId::Local(token);
        let pos = self.messages.iter().position(|m| m.id == local_id)?;
        if self.timer.phase() == SessionPhase::Ending {
            self.reconciled.insert(token, server_id);
        }

        if self
            .messages
            .iter()
            .any(|m| m.id == MessageId::Remote(server_id))
        {
            // 远程刷新已经带回了同一条消息，去掉本地副本
            self.messages.remove(pos);
            return None;
        }

        let msg = &mut self.messages[pos];
        msg.id = MessageId::Remote(server_id);
        events.push(Event::Updated(msg.clone()));
        match (sent.session_id, msg.session_id) {
            (None, Some(session_id)) => Some(SessionAssignment {
                session_id,
                message_ids: vec![server_id],
            }),
            _ => None,
        }
    }

    /// 本次结束的会话包含的消息 ID，总结期间被同步替换的服务器 ID 也算在内
    fn session_members(&mut self, batch: &[ChatMessage]) -> HashSet<MessageId> {
        let mut members: HashSet<MessageId> = batch.iter().map(|m| m.id).collect();
        for msg in batch {
            if let MessageId::Local(token) = msg.id {
                if let Some(server_id) = self.reconciled.remove(&token) {
                    members.insert(MessageId::Remote(server_id));
                }
            }
        }
        members
    }
}

/// 写入远程返回时，把草稿里的本地 ID 换成服务器 ID
///
/// 写入期间消息已经归入会话时，返回需要补做的归档。
fn reconcile_stored(
    drafts: &mut [ChatMessage],
    token: Uuid,
    server_id: i64,
    sent: &ChatMessage,
) -> Option<Option<SessionAssignment>> {
    let msg = drafts
        .iter_mut()
        .find(|m| m.id == MessageId::Local(token))?;
    msg.id = MessageId::Remote(server_id);
    Some(match (sent.session_id, msg.session_id) {
        (None, Some(session_id)) => Some(SessionAssignment {
            session_id,
            message_ids: vec![server_id],
        }),
        _ => None,
    })
}

fn millis(d: Duration) -> i64 {
    d.as_millis() as i64
}

struct Inner {
    config: ClientConfig,
    deps: CompanionDeps,
    listener: Arc<dyn CompanionListener>,
    state: Mutex<PipelineState>,
    draft_writer: DraftWriter,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// 陪伴聊天客户端
///
/// 核心会话管道实现
#[derive(Clone)]
pub struct CompanionClient {
    inner: Arc<Inner>,
}

impl CompanionClient {
    /// 创建新的客户端（使用默认空监听器，必须在 tokio 运行时内调用）
    pub fn new(config: ClientConfig, deps: CompanionDeps) -> Self {
        Self::with_listener(config, deps, Arc::new(EmptyCompanionListener))
    }

    /// 创建新的客户端（带自定义监听器）
    pub fn with_listener(
        config: ClientConfig,
        deps: CompanionDeps,
        listener: Arc<dyn CompanionListener>,
    ) -> Self {
        let (draft_writer, _writer_task) = DraftWriter::spawn(deps.drafts.clone());
        let state = PipelineState::new(config.inactivity_window);
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                listener,
                state: Mutex::new(state),
                draft_writer,
                driver: std::sync::Mutex::new(None),
            }),
        }
    }

    /// 按配置创建 HTTP 依赖和 SQLite 草稿存储，再创建客户端
    pub async fn connect(
        config: ClientConfig,
        listener: Arc<dyn CompanionListener>,
    ) -> anyhow::Result<Self> {
        info!(
            "[Pipeline] 创建客户端，API: {}, 草稿库: {}",
            config.api_base_url, config.draft_db_url
        );
        let deps = CompanionDeps::from_config(&config).await?;
        Ok(Self::with_listener(config, deps, listener))
    }

    fn now(&self) -> i64 {
        self.inner.deps.clock.now_millis()
    }

    /// 草稿内容写透到草稿存储（异步，失败只记录日志）
    fn write_through(&self, state: &PipelineState) {
        let Some(user) = state.user_id.as_deref() else {
            return;
        };
        let key = draft_key(user);
        let drafts = state.draft_messages();
        if drafts.is_empty() {
            self.inner.draft_writer.remove(key);
        } else {
            self.inner.draft_writer.save(key, drafts);
        }
    }

    /// 修改某个用户的草稿
    ///
    /// 用于用户已切走后才返回的远程结果。用户已经切回来时改内存中的消息。
    async fn patch_draft<T>(
        &self,
        user: &str,
        patch: impl FnOnce(&mut Vec<ChatMessage>) -> Option<T>,
    ) -> Option<T> {
        self.inner.draft_writer.flush().await;
        let key = draft_key(user);
        let loaded = self.inner.deps.drafts.load(&key).await;

        let mut state = self.inner.state.lock().await;
        if state.user_id.as_deref() == Some(user) {
            let result = patch(&mut state.messages);
            if result.is_some() {
                self.write_through(&state);
            }
            return result;
        }
        let mut drafts = match loaded {
            Ok(list) => list,
            Err(e) => {
                error!("[Pipeline] 读取草稿失败 {}: {:#}", key, e);
                return None;
            }
        };
        let result = patch(&mut drafts)?;
        drafts.retain(|m| m.is_open() || m.id.is_local());
        if drafts.is_empty() {
            self.inner.draft_writer.remove(key);
        } else {
            self.inner.draft_writer.save(key, drafts);
        }
        Some(result)
    }

    async fn emit(&self, events: Vec<Event>) {
        let listener = &self.inner.listener;
        for event in events {
            match event {
                Event::Appended(msg) => listener.on_message_appended(msg).await,
                Event::Updated(msg) => listener.on_message_updated(msg).await,
                Event::Typing(typing) => listener.on_typing_changed(typing).await,
                Event::SessionEnded(session_id) => listener.on_session_ended(session_id).await,
                Event::CheckupCreated(session_id) => listener.on_checkup_created(session_id).await,
                Event::Error(message) => listener.on_error(message).await,
            }
        }
    }

    // ========== 身份 ==========

    /// 切换当前用户
    ///
    /// 先清空内存中的消息，再读取新用户的草稿。只恢复属于新用户的消息：
    /// 未归档的进入当前会话，已归档但还没写入远程的作为历史恢复，等下一次同步写入。
    /// 返回恢复到当前会话的消息数。
    pub async fn switch_user(&self, user_id: Option<String>) -> usize {
        let mut events = Vec::new();
        let generation = {
            let mut state = self.inner.state.lock().await;
            info!("[Pipeline] 切换用户: {:?} -> {:?}", state.user_id, user_id);
            state.clear_for_identity(user_id.clone(), &mut events);
            state.generation
        };
        self.emit(events).await;

        let Some(user) = user_id else {
            return 0;
        };

        // 先等旧的写入落盘，避免读到过期草稿
        self.inner.draft_writer.flush().await;
        let key = draft_key(&user);
        let stored = match self.inner.deps.drafts.load(&key).await {
            Ok(list) => list,
            Err(e) => {
                error!("[Pipeline] 读取草稿失败 {}: {:#}", key, e);
                Vec::new()
            }
        };
        let total = stored.len();
        let restored: Vec<ChatMessage> = stored
            .into_iter()
            .filter(|m| m.user_id == user && (m.is_open() || m.id.is_local()))
            .collect();
        if restored.len() != total {
            warn!(
                "[Pipeline] 草稿中有 {} 条消息已同步归档或不属于用户 {}，已丢弃",
                total - restored.len(),
                user
            );
        }

        let mut events = Vec::new();
        let count = {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                debug!("[Pipeline] 读取草稿期间用户再次切换，丢弃结果");
                return 0;
            }
            let count = restored.iter().filter(|m| m.is_open()).count();
            let dropped = restored.len() != total;
            events.extend(restored.iter().cloned().map(Event::Appended));
            // 读取期间可能已经有新消息，草稿排在前面
            let mut merged = restored;
            merged.append(&mut state.messages);
            state.messages = merged;
            if dropped {
                self.write_through(&state);
            }
            count
        };
        self.emit(events).await;
        info!("[Pipeline] ✅ 用户 {} 恢复 {} 条草稿消息", user, count);
        count
    }

    // ========== 消息管道 ==========

    /// 发送用户消息
    ///
    /// 消息立即追加到内存状态，AI 回复在防抖延迟后触发；延迟内的多条消息合并成一次调用。
    pub async fn send_message(&self, text: &str) -> Result<MessageId> {
        let now = self.now();
        let mut events = Vec::new();
        let result = {
            let mut state = self.inner.state.lock().await;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Err(state.fail(CompanionError::EmptyMessage, &mut events))
            } else if let Some(user) = state.user_id.clone() {
                let msg = ChatMessage::new_local(trimmed.to_string(), Author::User, user, now);
                let id = msg.id;
                state.messages.push(msg.clone());
                state.session_ended = false;
                state.timer.touch(now);
                state.pending_batch.push(trimmed.to_string());
                state.response_due_at = Some(now + millis(self.inner.config.response_delay));
                self.write_through(&state);
                debug!(
                    "[Pipeline] 📤 用户消息 {} 已追加，待回复批次 {} 条",
                    id,
                    state.pending_batch.len()
                );
                events.push(Event::Appended(msg));
                Ok(id)
            } else {
                Err(state.fail(
                    CompanionError::Unauthenticated {
                        operation: "发送消息",
                    },
                    &mut events,
                ))
            }
        };
        self.emit(events).await;
        result
    }

    /// 推进所有到期的计时器：展示回复、触发防抖后的 AI 调用、不活跃超时
    pub async fn tick(&self) {
        let now = self.now();
        let mut events = Vec::new();
        let (response_job, inactivity_due) = {
            let mut state = self.inner.state.lock().await;
            if state.reveal_due(now, &mut events) {
                self.write_through(&state);
            }

            let response_job = if state.response_due_at.is_some_and(|due| now >= due) {
                state.response_due_at = None;
                let batch = std::mem::take(&mut state.pending_batch);
                match state.user_id.clone() {
                    Some(user) if !batch.is_empty() => {
                        state.responses_in_flight += 1;
                        state.set_typing(true, &mut events);
                        Some((batch.join("\n"), user, state.generation))
                    }
                    _ => None,
                }
            } else {
                None
            };

            let inactivity_due = state.user_id.is_some() && state.timer.is_due(now);
            if inactivity_due {
                // 先清掉截止时间，并发的 tick 不会重复触发
                state.timer.cancel();
            }
            (response_job, inactivity_due)
        };
        self.emit(events).await;

        if let Some((combined, user, generation)) = response_job {
            self.run_response(combined, user, generation).await;
        }
        if inactivity_due {
            info!("[Timer] ⏰ 会话不活跃超时，自动结束");
            if let Err(e) = self.close_session().await {
                debug!("[Timer] 自动结束会话未完成: {}", e);
            }
        }
    }

    async fn run_response(&self, combined: String, user: String, generation: u64) {
        info!(
            "[Pipeline] 🤖 请求 AI 回复，合并 {} 条用户输入",
            combined.lines().count()
        );
        let result = self.inner.deps.responder.respond(&combined, &user).await;

        let now = self.now();
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                warn!("[Pipeline] 用户已切换，丢弃过期的 AI 回复");
                return;
            }
            state.responses_in_flight = state.responses_in_flight.saturating_sub(1);
            match result {
                Ok(replies) => {
                    let stagger = millis(self.inner.config.stagger_delay);
                    // 每条回复都排在上一条之后
                    let mut due = match state.reveal_queue.back() {
                        Some(last) => (last.due_at + stagger).max(now),
                        None => now,
                    };
                    for text in replies.into_iter().filter(|t| !t.trim().is_empty()) {
                        state.reveal_queue.push_back(PendingReveal { text, due_at: due });
                        due += stagger;
                    }
                    if state.reveal_due(now, &mut events) {
                        self.write_through(&state);
                    }
                }
                Err(e) => {
                    error!("[Pipeline] AI 回复失败: {:#}", e);
                    let fallback = ChatMessage::new_local(
                        self.inner.config.fallback_reply.clone(),
                        Author::Ai,
                        user,
                        now,
                    );
                    state.messages.push(fallback.clone());
                    events.push(Event::Appended(fallback));
                    self.write_through(&state);
                    state.settle_typing(&mut events);
                    state.fail(CompanionError::remote(&e), &mut events);
                }
            }
        }
        self.emit(events).await;
    }

    // ========== 会话生命周期 ==========

    /// 重置不活跃计时器（Idle 时开始计时）
    pub async fn reset_inactivity_timer(&self) -> Result<()> {
        let now = self.now();
        let mut events = Vec::new();
        let result = {
            let mut state = self.inner.state.lock().await;
            if state.user_id.is_none() {
                Err(state.fail(
                    CompanionError::Unauthenticated {
                        operation: "重置会话计时",
                    },
                    &mut events,
                ))
            } else {
                state.timer.touch(now);
                Ok(())
            }
        };
        self.emit(events).await;
        result
    }

    /// 用户手动结束会话
    ///
    /// 返回新建的会话 ID；会话为空时直接结束并返回 None。
    pub async fn end_session(&self) -> Result<Option<i64>> {
        info!("[Pipeline] 用户手动结束会话");
        self.close_session().await
    }

    /// 锁内准备结束流程：校验身份和消息归属，进入 Ending
    fn prepare_close(
        state: &mut PipelineState,
        now: i64,
        events: &mut Vec<Event>,
    ) -> Result<Option<(String, Vec<ChatMessage>, u64)>> {
        let Some(user) = state.user_id.clone() else {
            return Err(state.fail(
                CompanionError::Unauthenticated {
                    operation: "结束会话",
                },
                events,
            ));
        };
        if state.timer.phase() == SessionPhase::Ending {
            return Err(state.fail(CompanionError::SessionBusy, events));
        }

        let batch = state.open_messages();
        if batch.is_empty() {
            info!("[Pipeline] 当前会话没有消息，直接结束");
            state.timer.end_without_summary();
            state.session_ended = true;
            events.push(Event::SessionEnded(None));
            return Ok(None);
        }

        if let Some(foreign) = batch.iter().find(|m| m.user_id != user) {
            let err = CompanionError::OwnershipViolation {
                message_id: foreign.id.to_string(),
                owner: foreign.user_id.clone(),
                expected: user.clone(),
            };
            error!("[Pipeline] 🚨 结束会话中止: {}", err);
            state.timer.abort_ending(now);
            return Err(state.fail(err, events));
        }

        state.timer.begin_ending();
        Ok(Some((user, batch, state.generation)))
    }

    async fn close_session(&self) -> Result<Option<i64>> {
        let now = self.now();
        let mut events = Vec::new();
        let prepared = {
            let mut state = self.inner.state.lock().await;
            Self::prepare_close(&mut state, now, &mut events)
        };
        self.emit(events).await;
        let Some((user, batch, generation)) = prepared? else {
            return Ok(None);
        };

        info!("[Pipeline] 📝 总结会话，消息数: {}", batch.len());
        let session_id = match self.inner.deps.summarizer.summarize(&batch).await {
            Ok(id) => id,
            Err(e) => {
                error!("[Pipeline] 会话总结失败，会话保持开启: {:#}", e);
                let mut events = Vec::new();
                let err = {
                    let mut state = self.inner.state.lock().await;
                    if state.generation == generation {
                        state.timer.abort_ending(self.now());
                    }
                    state.fail(CompanionError::remote(&e), &mut events)
                };
                self.emit(events).await;
                return Err(err);
            }
        };

        let now = self.now();
        let mut events = Vec::new();
        let (to_assign, detached) = {
            let mut state = self.inner.state.lock().await;
            let members = state.session_members(&batch);
            if state.generation != generation {
                warn!(
                    "[Pipeline] 会话 {} 总结完成时用户已切换，归档写入 {} 的草稿",
                    session_id, user
                );
                let remote: Vec<i64> = members.iter().filter_map(|id| id.remote_id()).collect();
                (remote, Some(members))
            } else {
                let mut to_assign = Vec::new();
                for msg in state
                    .messages
                    .iter_mut()
                    .filter(|m| m.is_open() && members.contains(&m.id))
                {
                    msg.session_id = Some(session_id);
                    msg.updated_at = now;
                    if let Some(server_id) = msg.id.remote_id() {
                        to_assign.push(server_id);
                    }
                    events.push(Event::Updated(msg.clone()));
                }

                if state.timer.finish() == SessionPhase::Ended {
                    state.session_ended = true;
                }
                state.checkup_created = true;
                events.push(Event::SessionEnded(Some(session_id)));
                events.push(Event::CheckupCreated(session_id));
                self.write_through(&state);
                (to_assign, None)
            }
        };
        self.emit(events).await;

        if let Some(members) = detached {
            let archived = self
                .patch_draft(&user, |drafts| {
                    let mut count = 0;
                    for msg in drafts
                        .iter_mut()
                        .filter(|m| m.is_open() && members.contains(&m.id))
                    {
                        msg.session_id = Some(session_id);
                        msg.updated_at = now;
                        count += 1;
                    }
                    (count > 0).then_some(count)
                })
                .await;
            debug!(
                "[Pipeline] 用户 {} 的草稿归档 {} 条消息到会话 {}",
                user,
                archived.unwrap_or(0),
                session_id
            );
        }

        // 尚未持久化的消息会在下一次同步时带着会话 ID 写入
        if !to_assign.is_empty() {
            self.assign_or_queue(session_id, to_assign).await;
        }
        info!("[Pipeline] ✅ 会话 {} 已结束", session_id);
        Ok(Some(session_id))
    }

    /// 删除当前会话的草稿：清空打开的消息并结束会话，不创建会话记录
    ///
    /// 已写入远程的消息同时从远程删除，删除失败时由下一次同步重试。
    pub async fn delete_drafts(&self) -> Result<usize> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.inner.state.lock().await;
            match state.user_id.clone() {
                None => Err(state.fail(
                    CompanionError::Unauthenticated {
                        operation: "删除草稿",
                    },
                    &mut events,
                )),
                Some(_) if state.timer.phase() == SessionPhase::Ending => {
                    Err(state.fail(CompanionError::SessionBusy, &mut events))
                }
                Some(_) => {
                    let persisted: Vec<i64> = state
                        .messages
                        .iter()
                        .filter(|m| m.is_open())
                        .filter_map(|m| m.id.remote_id())
                        .collect();
                    state.discarded.extend(persisted.iter().copied());
                    let before = state.messages.len();
                    state.messages.retain(|m| !m.is_open());
                    let removed = before - state.messages.len();
                    state.pending_batch.clear();
                    state.response_due_at = None;
                    state.reveal_queue.clear();
                    state.settle_typing(&mut events);
                    self.write_through(&state);
                    state.timer.end_without_summary();
                    state.session_ended = true;
                    events.push(Event::SessionEnded(None));
                    info!("[Pipeline] 🗑️ 已删除 {} 条草稿消息", removed);
                    Ok((removed, persisted))
                }
            }
        };
        self.emit(events).await;
        let (removed, persisted) = result?;
        if !persisted.is_empty() {
            self.delete_or_queue(persisted).await;
        }
        Ok(removed)
    }

    // ========== 远程同步 ==========

    /// 把本地 ID 的消息写入远程，并重试失败的会话归档和远程删除
    ///
    /// 成功的消息换成服务器 ID；失败的保留本地 ID，下一次同步再试。
    pub async fn sync_pending_messages(&self) -> SyncReport {
        let (candidates, mut assignments, generation, has_deletes) = {
            let mut state = self.inner.state.lock().await;
            let candidates: Vec<ChatMessage> = state
                .messages
                .iter()
                .filter(|m| match m.id {
                    MessageId::Local(token) => !state.syncing.contains(&token),
                    MessageId::Remote(_) => false,
                })
                .cloned()
                .collect();
            for msg in &candidates {
                if let MessageId::Local(token) = msg.id {
                    state.syncing.insert(token);
                }
            }
            let outbox = std::mem::take(&mut state.assignment_outbox);
            (
                candidates,
                outbox,
                state.generation,
                !state.delete_outbox.is_empty(),
            )
        };

        let mut report = SyncReport::default();
        if candidates.is_empty() && assignments.is_empty() && !has_deletes {
            return report;
        }
        debug!(
            "[Sync] 开始同步，待写入 {} 条，待归档 {} 组",
            candidates.len(),
            assignments.len()
        );

        for msg in candidates {
            let MessageId::Local(token) = msg.id else {
                continue;
            };
            let result = self.inner.deps.messages.insert_message(&msg).await;
            let mut events = Vec::new();
            let mut detached = None;
            {
                let mut state = self.inner.state.lock().await;
                state.syncing.remove(&token);
                match result {
                    Ok(server_id) => {
                        report.inserted += 1;
                        if state.messages.iter().any(|m| m.id == msg.id) {
                            if let Some(follow_up) =
                                state.reconcile(token, server_id, &msg, &mut events)
                            {
                                assignments.push(follow_up);
                            }
                            self.write_through(&state);
                        } else if state.generation == generation {
                            // 写入期间草稿被删除，远程这一行也要删掉
                            debug!("[Sync] 消息 {} 已被丢弃，删除远程记录 {}", msg.id, server_id);
                            state.discarded.insert(server_id);
                            state.delete_outbox.push(server_id);
                        } else {
                            state.reconciled.insert(token, server_id);
                            detached = Some(server_id);
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            "[Sync] 消息 {} 同步失败，保留本地ID等待重试: {:#}",
                            msg.id, e
                        );
                    }
                }
            }
            self.emit(events).await;

            // 写入期间用户已切走，更新该用户的草稿
            if let Some(server_id) = detached {
                let follow_up = self
                    .patch_draft(&msg.user_id, |drafts| {
                        reconcile_stored(drafts, token, server_id, &msg)
                    })
                    .await;
                match follow_up {
                    Some(Some(assignment)) => assignments.push(assignment),
                    Some(None) => {}
                    None => warn!("[Sync] 草稿中找不到消息 {}，远程记录 {} 保留", msg.id, server_id),
                }
            }
        }

        for assignment in assignments {
            let count = assignment.message_ids.len();
            if self
                .assign_or_queue(assignment.session_id, assignment.message_ids)
                .await
            {
                report.assigned += count;
            }
        }

        let deletes = std::mem::take(&mut self.inner.state.lock().await.delete_outbox);
        if !deletes.is_empty() {
            let count = deletes.len();
            if self.delete_or_queue(deletes).await {
                report.deleted += count;
            }
        }

        info!(
            "[Sync] 同步完成: 写入 {}, 失败 {}, 归档 {}, 删除 {}",
            report.inserted, report.failed, report.assigned, report.deleted
        );
        report
    }

    /// 删除远程消息，失败时放入重试队列
    async fn delete_or_queue(&self, message_ids: Vec<i64>) -> bool {
        match self.inner.deps.messages.delete_messages(&message_ids).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "[Sync] 删除 {} 条远程消息失败，稍后重试: {:#}",
                    message_ids.len(),
                    e
                );
                self.inner
                    .state
                    .lock()
                    .await
                    .delete_outbox
                    .extend(message_ids);
                false
            }
        }
    }

    /// 归档消息到会话，失败时放入重试队列
    async fn assign_or_queue(&self, session_id: i64, message_ids: Vec<i64>) -> bool {
        match self
            .inner
            .deps
            .messages
            .assign_session(&message_ids, session_id, self.now())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "[Sync] 归档 {} 条消息到会话 {} 失败，稍后重试: {:#}",
                    message_ids.len(),
                    session_id,
                    e
                );
                self.inner
                    .state
                    .lock()
                    .await
                    .assignment_outbox
                    .push(SessionAssignment {
                        session_id,
                        message_ids,
                    });
                false
            }
        }
    }

    /// 从远程读取当前用户未归档的消息并合并到本地
    ///
    /// 只追加本地还没有、也没有被丢弃的服务器 ID，打开的消息按创建时间重新排序。返回新增条数。
    pub async fn refresh_from_remote(&self) -> Result<usize> {
        let mut events = Vec::new();
        let prepared = {
            let mut state = self.inner.state.lock().await;
            match state.user_id.clone() {
                Some(user) => Ok((user, state.generation)),
                None => Err(state.fail(
                    CompanionError::Unauthenticated {
                        operation: "刷新消息",
                    },
                    &mut events,
                )),
            }
        };
        self.emit(std::mem::take(&mut events)).await;
        let (user, generation) = prepared?;

        let remote = match self.inner.deps.messages.fetch_open_messages(&user).await {
            Ok(list) => list,
            Err(e) => {
                error!("[Sync] 读取远程消息失败: {:#}", e);
                let err = {
                    let mut state = self.inner.state.lock().await;
                    state.fail(CompanionError::remote(&e), &mut events)
                };
                self.emit(events).await;
                return Err(err);
            }
        };

        let added = {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                return Ok(0);
            }
            let known: HashSet<i64> = state
                .messages
                .iter()
                .filter_map(|m| m.id.remote_id())
                .collect();
            let fresh: Vec<ChatMessage> = remote
                .into_iter()
                .filter(|m| {
                    m.is_open()
                        && m.user_id == user
                        && m.id.remote_id().is_some_and(|id| {
                            !known.contains(&id) && !state.discarded.contains(&id)
                        })
                })
                .collect();

            if !fresh.is_empty() {
                events.extend(fresh.iter().cloned().map(Event::Appended));
                let (mut open, mut merged): (Vec<ChatMessage>, Vec<ChatMessage>) =
                    std::mem::take(&mut state.messages)
                        .into_iter()
                        .partition(|m| m.is_open());
                open.extend(fresh.iter().cloned());
                // 稳定排序，同一时间戳保持本地顺序
                open.sort_by_key(|m| m.created_at);
                merged.extend(open);
                state.messages = merged;
                self.write_through(&state);
            }
            fresh.len()
        };
        self.emit(events).await;
        debug!("[Sync] 远程刷新新增 {} 条消息", added);
        Ok(added)
    }

    // ========== 驱动与生命周期 ==========

    /// 启动驱动循环：按 `tick_interval` 推进计时器，按 `sync_interval` 同步消息
    pub fn start(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let tick_every = self.inner.config.tick_interval;
        let sync_every = self.inner.config.sync_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sync_ticker = interval(sync_every);
            sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let sync_due = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = sync_ticker.tick() => true,
                };
                let Some(inner) = weak.upgrade() else {
                    debug!("[Driver] 客户端已释放，驱动循环退出");
                    break;
                };
                let client = CompanionClient { inner };
                // 每次 tick 单独运行，网络调用不会阻塞后续 tick
                tokio::spawn(async move {
                    if sync_due {
                        client.sync_pending_messages().await;
                    } else {
                        client.tick().await;
                    }
                });
            }
        });

        match self.inner.driver.lock() {
            Ok(mut slot) => {
                if let Some(old) = slot.replace(handle) {
                    old.abort();
                }
                info!("[Driver] 🚀 驱动循环已启动");
            }
            Err(_) => {
                error!("[Driver] 驱动句柄锁已损坏，停止新启动的驱动循环");
                handle.abort();
            }
        }
    }

    /// 停止驱动循环并清除所有挂起的计时器，不触发总结
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.driver.lock().ok().and_then(|mut slot| slot.take()) {
            handle.abort();
        }
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            state.timer.cancel();
            state.response_due_at = None;
            state.pending_batch.clear();
            state.reveal_queue.clear();
            state.settle_typing(&mut events);
        }
        self.emit(events).await;
        self.inner.draft_writer.flush().await;
        info!("[Pipeline] 已停止，挂起的计时器已清除");
    }

    /// 等待此前的草稿写入全部完成
    pub async fn flush_drafts(&self) {
        self.inner.draft_writer.flush().await;
    }

    // ========== 状态读取 ==========

    /// 当前显示的全部消息（包含本进程内已归档的）
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().await.messages.clone()
    }

    /// 当前打开会话的消息
    pub async fn open_messages(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().await.open_messages()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.inner.state.lock().await.user_id.clone()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.state.lock().await.timer.phase()
    }

    pub async fn is_typing(&self) -> bool {
        self.inner.state.lock().await.typing
    }

    pub async fn session_ended(&self) -> bool {
        self.inner.state.lock().await.session_ended
    }

    pub async fn checkup_created(&self) -> bool {
        self.inner.state.lock().await.checkup_created
    }

    /// UI 展示过 checkup 提示后调用
    pub async fn acknowledge_checkup(&self) {
        self.inner.state.lock().await.checkup_created = false;
    }

    /// 错误槽位
    pub async fn last_error(&self) -> Option<CompanionError> {
        self.inner.state.lock().await.last_error.clone()
    }

    pub async fn clear_error(&self) {
        self.inner.state.lock().await.last_error = None;
    }

    /// 直接把消息放进内存状态（测试构造异常数据用）
    #[cfg(test)]
    pub(crate) async fn inject_message(&self, message: ChatMessage) {
        self.inner.state.lock().await.messages.push(message);
    }
}
