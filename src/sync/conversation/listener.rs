//! 同步监听器回调接口

use async_trait::async_trait;

/// 同步监听器回调接口
///
/// 后台同步对用户完全静默，这里的回调只用于宿主 UI 刷新和 CLI 输出。
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// 同步周期开始
    async fn on_sync_start(&self);

    /// 同步周期完成
    async fn on_sync_finish(&self);

    /// 同步周期失败（只有认证失败会走到这里）
    async fn on_sync_failed(&self, reason: String);

    /// 单条会话上传成功，拿到服务端 ID
    async fn on_conversation_uploaded(&self, local_id: String, remote_id: i64);

    /// 下载合并完成，物化了多少条新会话
    async fn on_conversations_merged(&self, materialized: usize);
}

/// 空实现（默认监听器）
pub struct EmptySyncListener;

#[async_trait]
impl SyncListener for EmptySyncListener {
    async fn on_sync_start(&self) {}
    async fn on_sync_finish(&self) {}
    async fn on_sync_failed(&self, _reason: String) {}
    async fn on_conversation_uploaded(&self, _local_id: String, _remote_id: i64) {}
    async fn on_conversations_merged(&self, _materialized: usize) {}
}
