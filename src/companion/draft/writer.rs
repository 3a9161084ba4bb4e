//! 草稿写入任务
//!
//! 所有草稿写入都经过同一个后台任务串行执行，保证按修改顺序落盘。
//! 调用方只负责投递（fire-and-forget），失败只记录日志，内存状态始终为准。

use crate::companion::draft::dao::DraftStore;
use crate::companion::message::models::ChatMessage;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum DraftCommand {
    Save {
        key: String,
        messages: Vec<ChatMessage>,
    },
    Remove {
        key: String,
    },
    Flush(oneshot::Sender<()>),
}

/// 草稿写入器
#[derive(Clone)]
pub struct DraftWriter {
    tx: mpsc::UnboundedSender<DraftCommand>,
}

impl DraftWriter {
    /// 启动后台写入任务（必须在 tokio 运行时内调用）
    pub fn spawn(store: Arc<dyn DraftStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<DraftCommand>();
        let handle = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    DraftCommand::Save { key, messages } => {
                        if let Err(e) = store.save(&key, &messages).await {
                            error!("[DraftWriter] 写入草稿失败 {}: {:#}", key, e);
                        }
                    }
                    DraftCommand::Remove { key } => {
                        if let Err(e) = store.remove(&key).await {
                            error!("[DraftWriter] 删除草稿失败 {}: {:#}", key, e);
                        }
                    }
                    DraftCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("[DraftWriter] 写入任务退出");
        });
        (Self { tx }, handle)
    }

    /// 投递一次覆盖写入
    pub fn save(&self, key: String, messages: Vec<ChatMessage>) {
        if self.tx.send(DraftCommand::Save { key, messages }).is_err() {
            warn!("[DraftWriter] 写入任务已退出，丢弃草稿写入");
        }
    }

    /// 投递一次删除
    pub fn remove(&self, key: String) {
        if self.tx.send(DraftCommand::Remove { key }).is_err() {
            warn!("[DraftWriter] 写入任务已退出，丢弃草稿删除");
        }
    }

    /// 等待此前投递的所有写入完成
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(DraftCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::draft::dao::MemoryDraftStore;
    use crate::companion::message::models::Author;

    #[tokio::test]
    async fn writes_land_in_order() {
        let store = Arc::new(MemoryDraftStore::new());
        let (writer, _handle) = DraftWriter::spawn(store.clone());
        let a = ChatMessage::new_local("a".into(), Author::User, "u1".into(), 1);
        let b = ChatMessage::new_local("b".into(), Author::User, "u1".into(), 2);

        writer.save("k".into(), vec![a.clone()]);
        writer.save("k".into(), vec![a.clone(), b.clone()]);
        writer.flush().await;
        assert_eq!(store.load("k").await.unwrap(), vec![a, b]);

        writer.remove("k".into());
        writer.flush().await;
        assert!(store.load("k").await.unwrap().is_empty());
    }
}
