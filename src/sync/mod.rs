//! 同步引擎
//!
//! 本地 SQLite 存储 + 远端 HTTP API 之间的双向会话同步

pub mod auth;
pub mod client;
pub mod conversation;
pub mod db;
pub mod types;

// 重新导出认证相关函数
pub use auth::{login_async, StaticTokenProvider, TokenProvider};

// 重新导出同步相关类型和函数
pub use client::{SyncClient, SyncPhase};
pub use conversation::{
    ConversationSyncer, LocalConversation, LocalMessage, MessageRole, SyncEngineConfig,
};
pub use types::SyncError;
