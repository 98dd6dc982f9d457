//! 会话同步服务层
//!
//! 实现上传/下载两个方向的调和逻辑。上传方向找出本地已完成、未同步的会话，
//! 重建问答对后逐条提交，成功才回写服务端 ID；下载方向把远端列表里既不在
//! 墓碑、也没物化过的会话落成本地记录。两个方向都假设可能与用户发起的
//! 删除/重命名并发执行：上传前重新取最新记录，下载前先查墓碑和 remote_id
//! 存在性，因此不需要全局锁。

use crate::sync::auth::TokenProvider;
use crate::sync::conversation::api::{ConversationApi, ConversationBackend};
use crate::sync::conversation::dao::{ConversationDao, TombstoneDao};
use crate::sync::conversation::listener::{EmptySyncListener, SyncListener};
use crate::sync::conversation::models::{
    LocalConversation, LocalMessage, MessageRole, SyncEngineConfig,
};
use crate::sync::conversation::pairing::{build_qa_pairs, derive_synced_topic};
use crate::sync::db::create_sqlite_pool;
use crate::sync::types::{ConversationPayload, SyncError};
use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 解析服务端的创建时间，解析失败回退到当前时间
fn parse_created_at(raw: &str) -> i64 {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt.timestamp_millis();
    }
    // 服务端偶尔返回不带时区的 ISO8601
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc().timestamp_millis();
    }
    warn!("[ConvSync] 无法解析创建时间 {:?}，回退为当前时间", raw);
    Utc::now().timestamp_millis()
}

/// 会话同步器
///
/// 无状态的调和器：所有可变状态都在 DAO 背后的存储里，
/// 同一个实例可以被多个周期复用。
pub struct ConversationSyncer {
    config: SyncEngineConfig,
    /// 远端接口
    backend: Arc<dyn ConversationBackend>,
    /// 会话 DAO
    dao: ConversationDao,
    /// 墓碑 DAO
    tombstones: TombstoneDao,
    /// 同步监听器
    listener: Arc<dyn SyncListener>,
    /// 协作式取消标记，登出时由编排器置位，条目之间检查
    cancelled: Arc<AtomicBool>,
}

impl ConversationSyncer {
    /// 创建新的会话同步器（HTTP 后端 + 默认空监听器）
    pub async fn new(config: SyncEngineConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        Self::with_listener(config, tokens, Arc::new(EmptySyncListener)).await
    }

    /// 创建新的会话同步器（HTTP 后端 + 自定义监听器）
    pub async fn with_listener(
        config: SyncEngineConfig,
        tokens: Arc<dyn TokenProvider>,
        listener: Arc<dyn SyncListener>,
    ) -> Result<Self> {
        info!(
            "[ConvSync] 创建会话同步器，用户: {}, SQLite数据库: {}",
            config.owner_email, config.db_path
        );
        let db = create_sqlite_pool(&config.db_path).await?;
        let backend = Arc::new(ConversationApi::new(
            reqwest::Client::new(),
            config.api_base_url.clone(),
            tokens,
        ));
        Self::with_backend(config, backend, listener, db).await
    }

    /// 创建新的会话同步器（自定义后端 + 共享数据库连接）
    pub async fn with_backend(
        config: SyncEngineConfig,
        backend: Arc<dyn ConversationBackend>,
        listener: Arc<dyn SyncListener>,
        db: Pool<Sqlite>,
    ) -> Result<Self> {
        let dao = ConversationDao::new(db.clone());
        dao.init_db().await?;
        Ok(Self {
            config,
            backend,
            dao,
            tombstones: TombstoneDao::new(db),
            listener,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 共享给编排器的取消标记
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// 同步监听器（编排器在周期边界上回调它）
    pub fn listener(&self) -> &dyn SyncListener {
        self.listener.as_ref()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 上传本地已完成、未同步的会话
    ///
    /// 逐条串行上传（限制服务端压力，也让错误能落到具体条目上）。
    /// 单条失败不影响其余条目，留到下一个周期重试；
    /// 只有 `Unauthorized` 会整体中止。返回成功上传的条数。
    pub async fn upload_pending(&self) -> Result<usize, SyncError> {
        let ids = self.dao.find_unsynced_completed(&self.config.owner_email).await?;
        info!("[ConvSync] 🔼 上传候选: {} 条", ids.len());

        let mut uploaded = 0;
        for local_id in ids {
            if self.is_cancelled() {
                info!("[ConvSync] 收到取消信号，中止后续上传");
                break;
            }

            // 重新取最新记录：用户删除可能与后台同步并发
            let conv = match self.dao.get_conversation(&local_id).await {
                Ok(Some(conv)) => conv,
                Ok(None) => {
                    debug!("[ConvSync]   会话 {} 已不存在，跳过", local_id);
                    continue;
                }
                Err(e) => {
                    warn!("[ConvSync]   读取会话 {} 失败，跳过: {}", local_id, e);
                    continue;
                }
            };

            let messages = match self.dao.get_messages(&local_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("[ConvSync]   读取消息 {} 失败，跳过: {}", local_id, e);
                    continue;
                }
            };

            let pairs = build_qa_pairs(&conv, &messages);
            if pairs.is_empty() {
                debug!("[ConvSync]   会话 {} 没有有效问答对，不上传", local_id);
                continue;
            }

            let payload = ConversationPayload {
                conversation: pairs,
            };
            match self.backend.save_conversation(&payload).await {
                Ok(saved) => {
                    if let Err(e) = self.dao.set_remote_id(&local_id, saved.id).await {
                        // 回写失败时会话保持未同步，下个周期重传同一载荷
                        warn!(
                            "[ConvSync]   回写远端ID失败: local={}, remote={}, err={}",
                            local_id, saved.id, e
                        );
                        continue;
                    }
                    info!(
                        "[ConvSync]   ✅ 会话已上传: local={}, remote={}",
                        local_id, saved.id
                    );
                    self.listener
                        .on_conversation_uploaded(local_id.clone(), saved.id)
                        .await;
                    uploaded += 1;
                }
                Err(SyncError::Unauthorized) => {
                    warn!("[ConvSync] 认证失败，中止上传");
                    return Err(SyncError::Unauthorized);
                }
                Err(e) => {
                    warn!(
                        "[ConvSync]   会话 {} 上传失败，下个周期重试: {}",
                        local_id, e
                    );
                }
            }
        }

        info!("[ConvSync] 🔼 上传完成，成功 {} 条", uploaded);
        Ok(uploaded)
    }

    /// 拉取远端会话列表并物化本地缺失的会话
    ///
    /// 墓碑里的、已物化的、没有内容的条目都跳过；其余在结尾用单个事务落库。
    /// 列表拉取的网络失败不致命（本周期跳过合并）；只有 `Unauthorized` 上抛。
    /// 返回本次物化的条数。
    pub async fn download_and_merge(&self) -> Result<usize, SyncError> {
        let remote = match self.backend.fetch_conversations().await {
            Ok(remote) => remote,
            Err(SyncError::Unauthorized) => return Err(SyncError::Unauthorized),
            Err(e) => {
                warn!("[ConvSync] 拉取远端列表失败，本周期跳过合并: {}", e);
                return Ok(0);
            }
        };

        info!("[ConvSync] 🔽 远端会话: {} 条", remote.len());

        let mut batch: Vec<(LocalConversation, Vec<LocalMessage>)> = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();

        for r in remote {
            if self.is_cancelled() {
                info!("[ConvSync] 收到取消信号，中止后续合并");
                break;
            }

            // 墓碑检查必须先于一切物化决策；墓碑读不出来时同样跳过，
            // 绝不在墓碑状态未确认时物化。单条存储失败只影响本条，
            // 留给下一个周期，不中止合并
            match self.tombstones.contains(r.id).await {
                Ok(true) => {
                    debug!("[ConvSync]   远端会话 {} 在墓碑中，跳过", r.id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("[ConvSync]   墓碑检查失败，跳过远端会话 {}: {}", r.id, e);
                    continue;
                }
            }
            if !seen.insert(r.id) {
                debug!("[ConvSync]   远端会话 {} 在响应中重复，跳过", r.id);
                continue;
            }
            // 已物化过就不再动它，保住本地的重命名
            match self.dao.get_conversation_by_remote_id(r.id).await {
                Ok(Some(_)) => {
                    debug!("[ConvSync]   远端会话 {} 已物化，跳过", r.id);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("[ConvSync]   存在性检查失败，跳过远端会话 {}: {}", r.id, e);
                    continue;
                }
            }
            if r.conversation.is_empty() {
                debug!("[ConvSync]   远端会话 {} 没有内容，跳过", r.id);
                continue;
            }

            let first_question = r
                .conversation
                .first()
                .map(|p| p.question.as_str())
                .unwrap_or("Session");
            let start_date = parse_created_at(&r.created_at);

            let mut conv = LocalConversation::new(
                self.config.owner_email.clone(),
                derive_synced_topic(first_question),
                start_date,
            );
            conv.remote_id = Some(r.id);
            // 服务端只存在已完成的会话
            conv.is_complete = true;

            // 时间戳只需保序，不承担语义
            let mut messages = Vec::with_capacity(r.conversation.len() * 2);
            for (i, pair) in r.conversation.iter().enumerate() {
                let offset = (i as i64) * 2;
                messages.push(LocalMessage::new(
                    conv.local_id.clone(),
                    pair.question.clone(),
                    MessageRole::Assistant,
                    start_date + offset,
                ));
                messages.push(LocalMessage::new(
                    conv.local_id.clone(),
                    pair.answer.clone(),
                    MessageRole::User,
                    start_date + offset + 1,
                ));
            }

            debug!(
                "[ConvSync]   物化远端会话: remote={}, 问答对 {} 条",
                r.id,
                r.conversation.len()
            );
            batch.push((conv, messages));
        }

        if batch.is_empty() {
            info!("[ConvSync] 🔽 没有需要物化的远端会话");
            return Ok(0);
        }

        let materialized = batch.len();
        self.dao.insert_materialized(&batch).await?;
        info!("[ConvSync] 🔽 合并完成，物化 {} 条", materialized);
        self.listener.on_conversations_merged(materialized).await;
        Ok(materialized)
    }

    /// 用户删除会话
    ///
    /// 顺序是约定死的：先写墓碑，再删本地行，最后尽力远端删除。
    /// 远端删除失败只记日志——墓碑已经保证它不会在下次下载时复活。
    pub async fn delete_conversation(&self, local_id: &str) -> Result<(), SyncError> {
        let Some(conv) = self.dao.get_conversation(local_id).await? else {
            debug!("[ConvSync] 删除目标 {} 不存在", local_id);
            return Ok(());
        };

        if let Some(remote_id) = conv.remote_id {
            self.tombstones.add(remote_id).await?;
        }

        self.dao.delete_conversation(local_id).await?;
        info!("[ConvSync] 🗑 已删除本地会话: {}", local_id);

        if let Some(remote_id) = conv.remote_id {
            if let Err(e) = self.backend.delete_conversation(remote_id).await {
                warn!(
                    "[ConvSync] 远端删除失败（墓碑已记录，不会复活）: remote={}, err={}",
                    remote_id, e
                );
            }
        }
        Ok(())
    }

    /// 用户重命名话题，与同步状态无关
    pub async fn rename_conversation(&self, local_id: &str, topic: &str) -> Result<(), SyncError> {
        self.dao.set_topic(local_id, topic).await
    }

    /// 当前用户的历史会话，最新的在前
    pub async fn get_history(&self) -> Result<Vec<LocalConversation>, SyncError> {
        self.dao.get_conversations_by_owner(&self.config.owner_email).await
    }

    /// 会话的消息流，按时间升序
    pub async fn get_messages(&self, local_id: &str) -> Result<Vec<LocalMessage>, SyncError> {
        self.dao.get_messages(local_id).await
    }
}
