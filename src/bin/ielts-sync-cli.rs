//! IELTS 同步 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示会话同步功能
//! 启动时通过命令行参数指定账号，自动登录并执行一个完整同步周期，
//! 随后打印本地历史列表

use anyhow::Result;
use clap::Parser;
use ielts_sync_core::sync::conversation::listener::SyncListener;
use ielts_sync_core::sync::conversation::service::ConversationSyncer;
use ielts_sync_core::sync::{login_async, StaticTokenProvider, SyncClient, SyncEngineConfig};
use std::sync::Arc;
use tracing::{error, info};

/// IELTS 同步 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "ielts-sync-cli")]
#[command(about = "IELTS 同步 CLI 客户端 - 用于测试和展示会话同步功能", long_about = None)]
struct Args {
    /// 账号邮箱
    #[arg(short, long)]
    email: String,

    /// 账号密码
    #[arg(short, long)]
    password: String,

    /// API 基础地址
    #[arg(long, default_value = "http://localhost:8000")]
    api_base_url: String,

    /// 本地 SQLite 数据库 URL
    #[arg(long, default_value = "sqlite://ielts_history.db?mode=rwc")]
    db: String,

    /// 日志级别（默认: info,ielts_sync_core=debug）
    #[arg(long, default_value = "info,ielts_sync_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")?;

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码（文件不需要颜色）
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

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

/// CLI 监听器（输出同步过程中的所有事件）
struct CliSyncListener;

#[async_trait::async_trait]
impl SyncListener for CliSyncListener {
    async fn on_sync_start(&self) {
        info!("[CLI/Sync] 🔄 同步开始");
    }

    async fn on_sync_finish(&self) {
        info!("[CLI/Sync] ✅ 同步完成");
    }

    async fn on_sync_failed(&self, reason: String) {
        error!("[CLI/Sync] ❌ 同步失败: {}", reason);
    }

    async fn on_conversation_uploaded(&self, local_id: String, remote_id: i64) {
        info!(
            "[CLI/Sync] 🔼 会话已上传: local={}, remote={}",
            local_id, remote_id
        );
    }

    async fn on_conversations_merged(&self, materialized: usize) {
        info!("[CLI/Sync] 🔽 合并完成，新物化 {} 条会话", materialized);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 IELTS 同步 CLI 客户端（测试模式）");
    info!("[CLI] 📧 账号: {}", args.email);
    info!("[CLI] 🌐 API: {}", args.api_base_url);

    // 登录
    info!("[CLI] 🔐 正在登录...");
    let token = login_async(&args.api_base_url, &args.email, &args.password)
        .await
        .map_err(|e| anyhow::anyhow!("登录失败: {}", e))?;
    info!("[CLI] ✅ 登录成功！");

    let tokens = Arc::new(StaticTokenProvider::new(token.access_token));

    // 创建同步器 + 编排器
    let config = SyncEngineConfig {
        owner_email: args.email.clone(),
        api_base_url: args.api_base_url.clone(),
        db_path: args.db.clone(),
    };
    let syncer =
        ConversationSyncer::with_listener(config, tokens, Arc::new(CliSyncListener)).await?;
    let syncer = Arc::new(syncer);
    let client = SyncClient::new(syncer.clone());

    // 登录后的首次同步
    client
        .sync_after_login()
        .await
        .map_err(|e| anyhow::anyhow!("同步失败: {}", e))?;

    // 显示本地历史
    let history = syncer.get_history().await?;
    info!("[CLI] 📋 本地历史会话（共 {} 个）:", history.len());
    for conv in history.iter().take(10) {
        let status = match conv.remote_id {
            Some(id) => format!("已同步 remote={}", id),
            None => "未同步".to_string(),
        };
        info!(
            "[CLI]   - {} | {} | 完成: {}",
            conv.topic, status, conv.is_complete
        );
    }

    info!("[CLI] 👋 程序退出");
    Ok(())
}
