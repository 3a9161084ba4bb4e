//! QuestLog 陪伴聊天 CLI 客户端（测试版）
//!
//! 启动时通过命令行参数指定用户和接口地址，从标准输入读取消息，
//! 所有 AI 回复、会话结束事件都通过日志展示。
//!
//! 支持的命令：`/end` 结束会话，`/drop` 删除当前草稿，`/sync` 立即同步，`/quit` 退出。

use anyhow::Result;
use clap::Parser;
use questlog_companion_core::{ChatMessage, ClientConfig, CompanionClient, CompanionListener};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// QuestLog 陪伴聊天 CLI
#[derive(Parser, Debug)]
#[command(name = "questlog-cli")]
#[command(about = "QuestLog 陪伴聊天 CLI - 用于测试会话生命周期和消息同步", long_about = None)]
struct Args {
    /// 用户 ID
    #[arg(short, long)]
    user_id: String,

    /// 数据库 REST 接口基础地址
    #[arg(long, default_value = "http://localhost:54321")]
    api_base_url: String,

    /// 项目 apikey
    #[arg(long, default_value = "")]
    api_key: String,

    /// 访问令牌（默认与 apikey 相同）
    #[arg(long)]
    access_token: Option<String>,

    /// AI 边缘函数基础地址（默认与 api_base_url 相同）
    #[arg(long)]
    agent_base_url: Option<String>,

    /// 本地草稿数据库
    #[arg(long, default_value = "sqlite://questlog_drafts.db?mode=rwc")]
    draft_db: String,

    /// 日志级别（默认: info,questlog_companion_core=debug）
    #[arg(long, default_value = "info,questlog_companion_core=debug")]
    log_level: String,

    /// 日志文件路径（追加写入）
    #[arg(long, default_value = "questlog-cli.log")]
    log_file: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str, log_path: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 设置了 RUST_LOG 时优先使用，否则用 --log-level
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 追加模式，多次运行的日志保留在同一个文件里
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .unwrap_or_else(|e| panic!("无法创建日志文件 {}: {}", log_path, e));

    // 控制台输出
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件输出（不带颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: {}", log_path);
}

/// 把所有回调打印到日志
struct CliListener;

#[async_trait::async_trait]
impl CompanionListener for CliListener {
    async fn on_message_appended(&self, message: ChatMessage) {
        if message.is_user() {
            info!("[CLI/Chat] 🙋 {}", message.text);
        } else {
            info!("[CLI/Chat] 🤖 {}", message.text);
        }
    }

    async fn on_message_updated(&self, message: ChatMessage) {
        info!(
            "[CLI/Chat] 🔄 消息更新: {} 会话: {:?}",
            message.id, message.session_id
        );
    }

    async fn on_typing_changed(&self, typing: bool) {
        if typing {
            info!("[CLI/Chat] ⌨️ 对方正在输入...");
        }
    }

    async fn on_session_ended(&self, session_id: Option<i64>) {
        match session_id {
            Some(id) => info!("[CLI/Session] ✅ 会话已结束，会话ID: {}", id),
            None => info!("[CLI/Session] ✅ 会话已结束（未生成记录）"),
        }
    }

    async fn on_checkup_created(&self, session_id: i64) {
        info!("[CLI/Session] 📋 已生成会话总结: {}", session_id);
    }

    async fn on_error(&self, message: String) {
        error!("[CLI/Error] ⚠️ {}", message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level, &args.log_file);

    info!("[CLI] 🚀 QuestLog 陪伴聊天 CLI（测试模式）");
    info!("[CLI] 👤 用户ID: {}", args.user_id);

    let mut config = ClientConfig::new(args.api_base_url.clone(), args.api_key.clone());
    if let Some(token) = args.access_token {
        config.access_token = token;
    }
    if let Some(agent) = args.agent_base_url {
        config.agent_base_url = agent;
    }
    config.draft_db_url = args.draft_db;

    let client = CompanionClient::connect(config, Arc::new(CliListener))
        .await
        .map_err(|e| anyhow::anyhow!("创建客户端失败: {:#}", e))?;

    let restored = client.switch_user(Some(args.user_id.clone())).await;
    info!("[CLI] 📂 恢复 {} 条草稿消息", restored);
    match client.refresh_from_remote().await {
        Ok(count) => info!("[CLI] 📥 从远程合并 {} 条消息", count),
        Err(e) => warn!("[CLI] 远程刷新失败，继续使用本地草稿: {}", e),
    }
    if let Err(e) = client.reset_inactivity_timer().await {
        warn!("[CLI] 启动计时失败: {}", e);
    }
    client.start();

    info!("[CLI] 💡 输入消息后回车发送；/end 结束会话，/drop 删除草稿，/sync 同步，/quit 退出");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        // 错误已经通过监听器输出
        match line.trim() {
            "/quit" => break,
            "/end" => {
                let _ = client.end_session().await;
            }
            "/drop" => {
                let _ = client.delete_drafts().await;
            }
            "/sync" => {
                let report = client.sync_pending_messages().await;
                info!(
                    "[CLI] 🔄 同步: 写入 {}, 失败 {}, 归档 {}, 删除 {}",
                    report.inserted, report.failed, report.assigned, report.deleted
                );
            }
            text => {
                let _ = client.send_message(text).await;
            }
        }
    }

    client.sync_pending_messages().await;
    client.shutdown().await;
    info!("[CLI] 👋 程序退出");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_defaults_and_can_be_overridden() {
        let args = Args::try_parse_from(["questlog-cli", "--user-id", "u1"]).unwrap();
        assert_eq!(args.log_file, "questlog-cli.log");

        let args = Args::try_parse_from([
            "questlog-cli",
            "--user-id",
            "u1",
            "--log-file",
            "/tmp/questlog.log",
        ])
        .unwrap();
        assert_eq!(args.log_file, "/tmp/questlog.log");
    }
}
