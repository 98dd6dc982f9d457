//! 会话模块
//!
//! 实现离线优先的会话同步：问答对重建、上传/下载调和、墓碑防复活

pub mod api;
pub mod dao;
pub mod listener;
pub mod models;
pub mod pairing;
pub mod service;

// 重新导出主要类型和函数
pub use api::{ConversationApi, ConversationBackend};
pub use dao::{ConversationDao, TombstoneDao};
pub use listener::{EmptySyncListener, SyncListener};
pub use models::{LocalConversation, LocalMessage, MessageRole, SyncEngineConfig};
pub use pairing::{build_qa_pairs, derive_synced_topic};
pub use service::ConversationSyncer;
