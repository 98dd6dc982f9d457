pub mod sync;

// 重新导出常用类型和函数，方便外部使用
pub use sync::{
    client::{SyncClient, SyncPhase},
    conversation::{ConversationSyncer, LocalConversation, LocalMessage, SyncEngineConfig},
    login_async, StaticTokenProvider, SyncError, TokenProvider,
};
