//! 同步编排器
//!
//! 把两个调和器串成固定顺序的周期：先上传、后下载——本设备的新会话必须
//! 先到服务端，随后的下载才能在统一的远端列表上做合并判断。
//! 同一时刻最多一个周期在飞（后到的触发直接丢弃，不排队），
//! 登出后置取消标记，直到下一次登录之前所有触发都是空操作。

use crate::sync::conversation::service::ConversationSyncer;
use crate::sync::types::SyncError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// 同步周期所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// 空闲，没有周期在执行
    Idle,
    /// 上传方向执行中
    Uploading,
    /// 下载方向执行中
    Downloading,
    /// 已取消（登出后），等待下一次登录恢复
    Aborted,
}

/// 同步客户端（编排器）
///
/// 触发来源只有三个：登录完成、回到前台、用户显式刷新。
/// 定时器轮询是刻意不做的，见 `sync_on_foreground` 的去重逻辑。
pub struct SyncClient {
    syncer: Arc<ConversationSyncer>,
    /// 在飞标记，compare_exchange 保证同一时刻只有一个周期
    in_flight: AtomicBool,
    /// 与 syncer 共享的取消标记
    cancelled: Arc<AtomicBool>,
    phase: Mutex<SyncPhase>,
    /// 本次登录会话内是否已同步过（前台触发的去重依据）
    synced_this_session: AtomicBool,
}

impl SyncClient {
    pub fn new(syncer: Arc<ConversationSyncer>) -> Self {
        let cancelled = syncer.cancel_flag();
        Self {
            syncer,
            in_flight: AtomicBool::new(false),
            cancelled,
            phase: Mutex::new(SyncPhase::Idle),
            synced_this_session: AtomicBool::new(false),
        }
    }

    /// 当前所处阶段（给 UI / CLI 展示用）
    pub fn phase(&self) -> SyncPhase {
        self.phase.lock().map(|p| *p).unwrap_or(SyncPhase::Idle)
    }

    fn set_phase(&self, phase: SyncPhase) {
        if let Ok(mut guard) = self.phase.lock() {
            *guard = phase;
        }
    }

    /// 触发一个同步周期
    ///
    /// 返回 `Ok(true)` 表示周期实际执行并完成；`Ok(false)` 表示被丢弃
    /// （已有周期在飞，或登出后处于取消态）。只有认证失败以 `Err` 上抛。
    pub async fn sync_now(&self) -> Result<bool, SyncError> {
        if self.cancelled.load(Ordering::SeqCst) {
            info!("[SyncClient] 处于取消态，忽略同步触发");
            return Ok(false);
        }
        // 后到的触发丢弃，不排队
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("[SyncClient] 已有同步周期在执行，忽略本次触发");
            return Ok(false);
        }

        let result = self.run_cycle().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle(&self) -> Result<bool, SyncError> {
        info!("[SyncClient] 🔄 同步周期开始");
        self.syncer.listener().on_sync_start().await;

        self.set_phase(SyncPhase::Uploading);
        if let Err(e) = self.syncer.upload_pending().await {
            warn!("[SyncClient] 同步周期中止: {}", e);
            self.set_phase(SyncPhase::Idle);
            self.syncer.listener().on_sync_failed(e.to_string()).await;
            return Err(e);
        }

        if self.cancelled.load(Ordering::SeqCst) {
            info!("[SyncClient] 上传后收到取消信号，跳过下载");
            self.set_phase(SyncPhase::Aborted);
            return Ok(false);
        }

        self.set_phase(SyncPhase::Downloading);
        if let Err(e) = self.syncer.download_and_merge().await {
            warn!("[SyncClient] 同步周期中止: {}", e);
            self.set_phase(SyncPhase::Idle);
            self.syncer.listener().on_sync_failed(e.to_string()).await;
            return Err(e);
        }

        self.set_phase(SyncPhase::Idle);
        self.syncer.listener().on_sync_finish().await;
        info!("[SyncClient] ✅ 同步周期完成");
        Ok(true)
    }

    /// 登录完成后的首次同步
    ///
    /// 清掉上一个会话遗留的取消标记，并把本会话标记为已同步，
    /// 让紧随其后的前台触发不再重复执行。
    pub async fn sync_after_login(&self) -> Result<bool, SyncError> {
        info!("[SyncClient] 登录完成，执行首次同步");
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_phase(SyncPhase::Idle);
        self.synced_this_session.store(true, Ordering::SeqCst);
        self.sync_now().await
    }

    /// 回到前台时的同步（本次登录会话内只执行一次）
    pub async fn sync_on_foreground(&self) -> Result<bool, SyncError> {
        if self.synced_this_session.swap(true, Ordering::SeqCst) {
            info!("[SyncClient] 本会话已同步过，前台触发忽略");
            return Ok(false);
        }
        self.sync_now().await
    }

    /// 登出：置取消标记，正在执行的周期在下一个条目边界停下
    pub fn on_session_ended(&self) {
        info!("[SyncClient] 会话结束，停止同步");
        self.cancelled.store(true, Ordering::SeqCst);
        self.synced_this_session.store(false, Ordering::SeqCst);
        self.set_phase(SyncPhase::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::conversation::api::ConversationBackend;
    use crate::sync::conversation::listener::EmptySyncListener;
    use crate::sync::conversation::models::SyncEngineConfig;
    use crate::sync::db::create_sqlite_pool;
    use crate::sync::types::{ConversationPayload, RemoteConversation};
    use async_trait::async_trait;

    struct StaticBackend {
        remote: Vec<RemoteConversation>,
    }

    #[async_trait]
    impl ConversationBackend for StaticBackend {
        async fn fetch_conversations(&self) -> Result<Vec<RemoteConversation>, SyncError> {
            Ok(self.remote.clone())
        }

        async fn save_conversation(
            &self,
            payload: &ConversationPayload,
        ) -> Result<RemoteConversation, SyncError> {
            Ok(RemoteConversation {
                id: 1,
                created_at: "2024-05-01T10:00:00Z".to_string(),
                conversation: payload.conversation.clone(),
            })
        }

        async fn delete_conversation(&self, _remote_id: i64) -> Result<(), SyncError> {
            Ok(())
        }
    }

    async fn test_client(remote: Vec<RemoteConversation>) -> SyncClient {
        let db = create_sqlite_pool("sqlite::memory:").await.unwrap();
        let config = SyncEngineConfig {
            owner_email: "a@x.com".to_string(),
            api_base_url: "http://localhost:8000".to_string(),
            db_path: "sqlite::memory:".to_string(),
        };
        let syncer = ConversationSyncer::with_backend(
            config,
            Arc::new(StaticBackend { remote }),
            Arc::new(EmptySyncListener),
            db,
        )
        .await
        .unwrap();
        SyncClient::new(Arc::new(syncer))
    }

    #[tokio::test]
    async fn test_cycle_runs_and_returns_to_idle() {
        let client = test_client(Vec::new()).await;
        assert_eq!(client.phase(), SyncPhase::Idle);
        assert!(client.sync_now().await.unwrap());
        assert_eq!(client.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_triggers_after_logout_are_noops() {
        let client = test_client(Vec::new()).await;
        client.on_session_ended();
        assert_eq!(client.phase(), SyncPhase::Aborted);

        assert!(!client.sync_now().await.unwrap());
        assert!(!client.sync_on_foreground().await.unwrap());
        assert_eq!(client.phase(), SyncPhase::Aborted);
    }

    #[tokio::test]
    async fn test_login_resets_cancellation() {
        let client = test_client(Vec::new()).await;
        client.on_session_ended();

        assert!(client.sync_after_login().await.unwrap());
        assert_eq!(client.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_foreground_sync_runs_once_per_session() {
        let client = test_client(Vec::new()).await;

        // 会话内第一次前台触发执行
        assert!(client.sync_on_foreground().await.unwrap());
        // 第二次去重
        assert!(!client.sync_on_foreground().await.unwrap());

        // 登出再登录后重新计数
        client.on_session_ended();
        client.sync_after_login().await.unwrap();
        assert!(!client.sync_on_foreground().await.unwrap());
    }
}
