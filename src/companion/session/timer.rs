//! 会话不活跃计时器（显式状态机）
//!
//! 计时器本身不持有任何定时任务，只记录截止时间；由客户端的驱动循环
//! 在每次 tick 时用 `is_due` 判断是否到期。

use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    /// 尚未开始计时
    Idle,
    /// 会话进行中，计时器运行
    Active,
    /// 正在总结（AI 调用进行中）
    Ending,
    /// 会话已结束，直到下一条消息开启新会话
    Ended,
}

/// 不活跃计时器
#[derive(Debug, Clone)]
pub struct SessionTimer {
    phase: SessionPhase,
    /// 不活跃超时的截止时间（毫秒），同一时刻最多只有一个
    deadline: Option<i64>,
    window_ms: i64,
}

impl SessionTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            phase: SessionPhase::Idle,
            deadline: None,
            window_ms: window.as_millis() as i64,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    /// 用户活动：重新计时
    ///
    /// Ending 期间只记录新的截止时间，阶段保持不变，`finish` 时再决定进入 Active。
    pub fn touch(&mut self, now: i64) {
        self.deadline = Some(now + self.window_ms);
        if self.phase != SessionPhase::Ending {
            if self.phase != SessionPhase::Active {
                debug!("[Timer] {:?} -> Active", self.phase);
            }
            self.phase = SessionPhase::Active;
        }
    }

    /// 不活跃超时是否已到期
    pub fn is_due(&self, now: i64) -> bool {
        self.phase == SessionPhase::Active && self.deadline.is_some_and(|d| now >= d)
    }

    /// 进入 Ending；已经在 Ending 时返回 false
    pub fn begin_ending(&mut self) -> bool {
        if self.phase == SessionPhase::Ending {
            return false;
        }
        debug!("[Timer] {:?} -> Ending", self.phase);
        self.phase = SessionPhase::Ending;
        self.deadline = None;
        true
    }

    /// 结束流程失败：回到 Active 并重新计时，等待下一次超时或手动结束重试
    pub fn abort_ending(&mut self, now: i64) {
        debug!("[Timer] {:?} -> Active（结束流程中止）", self.phase);
        self.phase = SessionPhase::Active;
        self.deadline = Some(now + self.window_ms);
    }

    /// 结束流程完成
    ///
    /// Ending 期间有新的活动时直接进入 Active（新会话已经开始），否则进入 Ended。
    pub fn finish(&mut self) -> SessionPhase {
        self.phase = if self.deadline.is_some() {
            SessionPhase::Active
        } else {
            SessionPhase::Ended
        };
        debug!("[Timer] Ending -> {:?}", self.phase);
        self.phase
    }

    /// 不经过总结直接结束（空会话或删除草稿）
    pub fn end_without_summary(&mut self) {
        debug!("[Timer] {:?} -> Ended（无需总结）", self.phase);
        self.phase = SessionPhase::Ended;
        self.deadline = None;
    }

    /// 清除挂起的超时（卸载时调用，不触发任何副作用）
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// 切换用户时回到初始状态
    pub fn reset(&mut self) {
        self.phase = SessionPhase::Idle;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn touch_starts_and_rearms_timer() {
        let mut timer = SessionTimer::new(WINDOW);
        assert_eq!(timer.phase(), SessionPhase::Idle);
        assert!(!timer.is_due(i64::MAX));

        timer.touch(1_000);
        assert_eq!(timer.phase(), SessionPhase::Active);
        assert_eq!(timer.deadline(), Some(301_000));

        timer.touch(200_000);
        assert!(!timer.is_due(301_000));
        assert!(timer.is_due(500_000));
    }

    #[test]
    fn ending_is_entered_once() {
        let mut timer = SessionTimer::new(WINDOW);
        timer.touch(0);
        assert!(timer.begin_ending());
        assert!(!timer.begin_ending());
        assert!(!timer.is_due(i64::MAX));
        assert_eq!(timer.finish(), SessionPhase::Ended);
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn activity_during_ending_starts_next_session() {
        let mut timer = SessionTimer::new(WINDOW);
        timer.touch(0);
        timer.begin_ending();
        timer.touch(10);
        assert_eq!(timer.phase(), SessionPhase::Ending);
        assert_eq!(timer.finish(), SessionPhase::Active);
        assert!(timer.is_due(300_010));
    }

    #[test]
    fn abort_returns_to_active_with_fresh_deadline() {
        let mut timer = SessionTimer::new(WINDOW);
        timer.begin_ending();
        timer.abort_ending(5_000);
        assert_eq!(timer.phase(), SessionPhase::Active);
        assert_eq!(timer.deadline(), Some(305_000));
    }

    #[test]
    fn cancel_clears_deadline_only() {
        let mut timer = SessionTimer::new(WINDOW);
        timer.touch(0);
        timer.cancel();
        assert_eq!(timer.phase(), SessionPhase::Active);
        assert!(!timer.is_due(i64::MAX));
        timer.reset();
        assert_eq!(timer.phase(), SessionPhase::Idle);
    }
}
